//! Backend configuration.

/// Runtime configuration for [`SqlStorageBackend`](crate::SqlStorageBackend).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    /// Database used when an operation names none. Transactions always run here.
    pub default_database: String,
    /// Every named database; each gets its own engine sharing one relational model.
    pub databases: Vec<String>,
    /// Connection string for SQL engines. `None` makes
    /// [`SqlStorageBackend::from_config`](crate::SqlStorageBackend::from_config)
    /// use the in-memory engine.
    pub connection_url: Option<String>,
    /// Pool size per database for SQL engines.
    pub max_connections: u32,
    /// Log every statement at `debug` level.
    pub log_statements: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            default_database: "default".to_string(),
            databases: vec!["default".to_string()],
            connection_url: None,
            max_connections: 10,
            log_statements: false,
        }
    }
}

impl BackendConfig {
    /// The configured databases with the default one first and no duplicates.
    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        let mut names = vec![self.default_database.clone()];
        for name in &self.databases {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }
}

/// Command-line/environment surface for [`BackendConfig`].
///
/// Meant to be `#[command(flatten)]`ed into a host binary's parser.
#[derive(clap::Args, Debug, Clone)]
pub struct BackendArgs {
    /// Default database name.
    #[arg(long = "default-database", env = "RELSTORE_DEFAULT_DATABASE", default_value = "default")]
    pub default_database: String,

    /// Additional named databases (comma separated).
    #[arg(long = "database", env = "RELSTORE_DATABASES", value_delimiter = ',')]
    pub databases: Vec<String>,

    /// Postgres connection URL; omit for the in-memory engine.
    #[arg(long = "database-url", env = "RELSTORE_DATABASE_URL")]
    pub connection_url: Option<String>,

    #[arg(long = "max-connections", env = "RELSTORE_MAX_CONNECTIONS", default_value_t = 10)]
    pub max_connections: u32,

    #[arg(long = "log-statements", env = "RELSTORE_LOG_STATEMENTS")]
    pub log_statements: bool,
}

impl From<BackendArgs> for BackendConfig {
    fn from(args: BackendArgs) -> Self {
        let mut config = Self {
            default_database: args.default_database,
            databases: args.databases.into_iter().filter(|name| !name.is_empty()).collect(),
            connection_url: args.connection_url,
            max_connections: args.max_connections,
            log_statements: args.log_statements,
        };
        config.databases = config.database_names();
        config
    }
}
