use std::io;
use std::sync::Arc;

use bytes::Bytes;
use codeassist_wire::apis::streaming_shapes::{scan_signature, SseEvent, SseLine, SseLineBuffer};
use codeassist_wire::StreamTranslator;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::signature::ContinuationStore;

const STREAM_BUFFER: usize = 16;

pub type ByteStream = ReceiverStream<Result<Bytes, io::Error>>;

/// What the relay does with each upstream chunk
pub enum StreamMode {
    /// Rewrite provider events into chat completion chunks
    Translate { model: String },
    /// Forward untouched, only watching for continuation tokens
    Passthrough,
}

/// Where continuation tokens seen on the stream are recorded
pub struct SignatureSink {
    pub store: Arc<ContinuationStore>,
    pub key: String,
}

impl SignatureSink {
    fn record(&self, signature: Option<&str>, last: &mut Option<String>) {
        if let Some(signature) = signature {
            if last.as_deref() != Some(signature) {
                self.store.record(&self.key, signature);
                *last = Some(signature.to_string());
            }
        }
    }
}

enum Processor {
    Translate(StreamTranslator),
    Passthrough { lines: SseLineBuffer, latest: Option<String> },
}

impl Processor {
    fn push(&mut self, chunk: Bytes) -> Vec<Bytes> {
        match self {
            Processor::Translate(translator) => translator.push(&chunk),
            Processor::Passthrough { lines, latest } => {
                scan_lines(&lines.push(&chunk), latest);
                vec![chunk]
            }
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        match self {
            Processor::Translate(translator) => translator.finish(),
            Processor::Passthrough { lines, latest } => {
                if let Some(line) = lines.finish() {
                    scan_lines(std::slice::from_ref(&line), latest);
                }
                Vec::new()
            }
        }
    }

    fn continuation(&self) -> Option<&str> {
        match self {
            Processor::Translate(translator) => translator.continuation(),
            Processor::Passthrough { latest, .. } => latest.as_deref(),
        }
    }
}

fn scan_lines(lines: &[SseLine], latest: &mut Option<String>) {
    for line in lines.iter().filter_map(SseLine::as_text) {
        if let Ok(event) = line.parse::<SseEvent>() {
            if let Some(signature) = scan_signature(&event.data) {
                *latest = Some(signature);
            }
        }
    }
}

/// Relay an upstream SSE body through a bounded channel.
///
/// The spawned task stops when the upstream ends, the receiver is dropped or
/// `cancel` fires.
pub fn relay(
    upstream: reqwest::Response,
    mode: StreamMode,
    sink: SignatureSink,
    cancel: CancellationToken,
) -> ByteStream {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(STREAM_BUFFER);
    let mut processor = match mode {
        StreamMode::Translate { model } => Processor::Translate(StreamTranslator::new(model)),
        StreamMode::Passthrough => Processor::Passthrough {
            lines: SseLineBuffer::new(),
            latest: None,
        },
    };

    tokio::spawn(async move {
        let mut byte_stream = upstream.bytes_stream();
        let mut recorded: Option<String> = None;

        loop {
            let item = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("stream cancelled");
                    break;
                }
                _ = tx.closed() => {
                    debug!("stream receiver dropped");
                    break;
                }
                item = byte_stream.next() => item,
            };

            match item {
                Some(Ok(chunk)) => {
                    let out = processor.push(chunk);
                    sink.record(processor.continuation(), &mut recorded);
                    for bytes in out {
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!("upstream stream failed: {}", e);
                    let _ = tx.send(Err(io::Error::new(io::ErrorKind::Other, e))).await;
                    break;
                }
                None => {
                    let tail = processor.finish();
                    sink.record(processor.continuation(), &mut recorded);
                    for bytes in tail {
                        if tx.send(Ok(bytes)).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
    });

    ReceiverStream::new(rx)
}
