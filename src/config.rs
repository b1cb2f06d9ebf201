use std::net::{AddrParseError, SocketAddr};

use budgetdb_core::{DateRange, Role};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::reports::ReportQuery;

#[derive(Parser, Debug)]
#[command(name = "budgetdb", about = "BudgetDB - home budget ledger with monthly balances")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "budgetdb.toml")]
    pub config: String,

    /// Port to listen on (overrides config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// SQLite database path (overrides config file)
    #[arg(short, long)]
    pub database: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the HTTP API (default)
    Serve,
    /// Register a user
    AddUser {
        username: String,
        #[arg(long)]
        password: String,
        /// admin or viewer
        #[arg(long, default_value = "viewer", value_parser = parse_role)]
        role: Role,
    },
    /// Close a period into a balance if its profit reaches the minimum
    CloseBalance {
        /// START..END, both inclusive
        range: DateRange,
        #[arg(long, default_value = "0")]
        min_profit: Decimal,
    },
    /// Delete the balance with the lowest amount
    DropUnprofitable,
    /// Print a report table
    Report {
        #[command(subcommand)]
        query: ReportQuery,
    },
    /// List balances whose aggregates disagree with their operations
    Check,
}

fn parse_role(s: &str) -> Result<Role, String> {
    Role::from_name(s).ok_or_else(|| format!("unknown role '{}', expected admin or viewer", s))
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,

    #[serde(default = "default_database")]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AuthConfig {
    /// When true, all API endpoints (except /health and /metrics) require authentication.
    #[serde(default)]
    pub enabled: bool,

    /// Static API keys for scripts. Interactive users log in with the
    /// credentials stored in the users table.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiKeyEntry {
    pub name: String,
    pub key: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "viewer".to_string()
}

fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_database() -> DatabaseConfig {
    DatabaseConfig {
        path: default_database_path(),
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_database_path() -> String {
    "budget.db".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: default_server(),
            logging: default_logging(),
            database: default_database(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    pub fn load(cli: &CliArgs) -> Self {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&contents).unwrap_or_else(|e| {
                eprintln!("Warning: Failed to parse config file: {}", e);
                Config::default()
            }),
            Err(_) => Config::default(),
        };

        // CLI overrides
        if let Some(port) = cli.port {
            config.server.port = port;
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }
        if let Some(ref path) = cli.database {
            config.database.path = path.clone();
        }

        config
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, AddrParseError> {
        format!("{}:{}", self.server.host, self.server.port).parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_sections_missing() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, "budget.db");
        assert_eq!(config.logging.level, "info");
        assert!(!config.auth.enabled);
        assert_eq!(config.listen_addr().unwrap().port(), 3000);
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::parse(
            r#"
            [server]
            host = "0.0.0.0"
            port = 8080

            [logging]
            level = "debug"
            json = true

            [database]
            path = "/var/lib/budgetdb/ledger.db"

            [auth]
            enabled = true

            [[auth.api_keys]]
            name = "backup-script"
            key = "k-123"
            "#,
        )
        .unwrap();
        assert_eq!(config.listen_addr().unwrap().to_string(), "0.0.0.0:8080");
        assert!(config.logging.json);
        assert_eq!(config.database.path, "/var/lib/budgetdb/ledger.db");
        assert!(config.auth.enabled);
        assert_eq!(config.auth.api_keys[0].role, "viewer");
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let cli = CliArgs::parse_from([
            "budgetdb",
            "--config",
            "/nonexistent/budgetdb.toml",
            "--port",
            "9000",
            "--database",
            ":memory:",
        ]);
        let config = Config::load(&cli);
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.database.path, ":memory:");
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_close_balance_command_parses_range() {
        let cli = CliArgs::parse_from([
            "budgetdb",
            "close-balance",
            "2024-11-01..2024-11-30",
            "--min-profit",
            "150.50",
        ]);
        match cli.command {
            Some(Command::CloseBalance { range, min_profit }) => {
                assert_eq!(range.end.day(), 30);
                assert_eq!(min_profit.to_string(), "150.50");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_add_user_rejects_unknown_role() {
        let cli = CliArgs::try_parse_from(["budgetdb", "add-user", "alice", "--password", "pw", "--role", "ADMIN"]).unwrap();
        match cli.command {
            Some(Command::AddUser { role, .. }) => assert_eq!(role, Role::Admin),
            other => panic!("unexpected command: {:?}", other),
        }

        let typo = CliArgs::try_parse_from(["budgetdb", "add-user", "alice", "--password", "pw", "--role", "amdin"]);
        assert!(typo.is_err());
    }
}
