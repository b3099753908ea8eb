use scout_core::AppError;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

/// Connection settings for the source/event store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }

    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Read `DATABASE_URL` (required) and `DATABASE_MAX_CONNECTIONS`
    /// (defaults to 5) from the environment.
    pub fn from_env() -> Result<Self, AppError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, AppError> {
        let url = lookup("DATABASE_URL")
            .filter(|url| !url.trim().is_empty())
            .ok_or_else(|| {
                AppError::ConfigError(
                    "DATABASE_URL not set. Sources and events are stored in PostgreSQL.".into(),
                )
            })?;

        let Some(raw) = lookup("DATABASE_MAX_CONNECTIONS") else {
            return Ok(Self::new(url));
        };
        match raw.trim().parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::new(url).with_max_connections(n)),
            _ => Err(AppError::ConfigError(format!(
                "Invalid DATABASE_MAX_CONNECTIONS '{raw}': must be a positive integer"
            ))),
        }
    }
}
