use std::fmt;

const SEPARATOR: char = '|';

/// The refresh secret together with the project ids discovered at login,
/// packed into the single string the credential store keeps as the refresh
/// token: `secret|project|managed`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RefreshParts {
    pub refresh_token: String,
    pub project_id: Option<String>,
    pub managed_project_id: Option<String>,
}

impl RefreshParts {
    pub fn new(refresh_token: impl Into<String>) -> Self {
        Self {
            refresh_token: refresh_token.into(),
            ..Default::default()
        }
    }

    pub fn parse(packed: &str) -> Self {
        let mut fields = packed.splitn(3, SEPARATOR);
        let refresh_token = fields.next().unwrap_or_default().to_string();
        let project_id = fields.next().and_then(non_empty);
        let managed_project_id = fields.next().and_then(non_empty);
        Self {
            refresh_token,
            project_id,
            managed_project_id,
        }
    }

    /// Trailing empty fields are omitted, so a bare secret packs to itself
    pub fn format(&self) -> String {
        let project = self.project_id.as_deref().unwrap_or_default();
        match self.managed_project_id.as_deref() {
            Some(managed) => format!("{}{}{}{}{}", self.refresh_token, SEPARATOR, project, SEPARATOR, managed),
            None if !project.is_empty() => format!("{}{}{}", self.refresh_token, SEPARATOR, project),
            None => self.refresh_token.clone(),
        }
    }

    /// Project for provider calls when discovery already ran at login
    pub fn effective_project(&self) -> Option<&str> {
        self.managed_project_id
            .as_deref()
            .or(self.project_id.as_deref())
    }
}

// values are kept exactly as stored so format and parse stay inverse
fn non_empty(field: &str) -> Option<String> {
    (!field.is_empty()).then(|| field.to_string())
}

impl fmt::Display for RefreshParts {
    // never prints the secret
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RefreshParts(project={:?}, managed={:?})",
            self.project_id, self.managed_project_id
        )
    }
}
