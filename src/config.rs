use crate::services::extractor::SevenZipMode;
use anyhow::{Context, Result, anyhow};
use clap::{Parser, ValueEnum};
use std::{env, str::FromStr};

const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024 * 1024;
const DEFAULT_SESSION_IDLE_SECS: u64 = 24 * 60 * 60;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub scratch_dir: String,
    pub database_url: String,
    pub public_base_url: Option<String>,
    pub max_path_depth: usize,
    pub seven_zip: SevenZipMode,
    pub seven_zip_bin: String,
    pub max_body_bytes: usize,
    /// Idle chunked sessions are dropped after this many seconds; 0 keeps
    /// them until they finish.
    pub session_idle_secs: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "File ingestion and retrieval gateway")]
pub struct Args {
    /// Host to bind to (overrides FILE_GATEWAY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides FILE_GATEWAY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where objects are stored (overrides FILE_GATEWAY_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Directory for chunk parts, merged artifacts and extraction
    /// (overrides FILE_GATEWAY_SCRATCH_DIR)
    #[arg(long)]
    pub scratch_dir: Option<String>,

    /// Database URL (overrides FILE_GATEWAY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base of generated download URLs (overrides FILE_GATEWAY_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Deepest archive entry path admitted, in segments
    /// (overrides FILE_GATEWAY_MAX_PATH_DEPTH)
    #[arg(long)]
    pub max_path_depth: Option<usize>,

    /// 7z backend (overrides FILE_GATEWAY_SEVEN_ZIP)
    #[arg(long, value_enum)]
    pub seven_zip: Option<SevenZipMode>,

    /// External 7z binary (overrides FILE_GATEWAY_SEVEN_ZIP_BIN)
    #[arg(long)]
    pub seven_zip_bin: Option<String>,

    /// Request body limit in bytes (overrides FILE_GATEWAY_MAX_BODY_BYTES)
    #[arg(long)]
    pub max_body_bytes: Option<usize>,

    /// Seconds before an idle chunked upload is dropped, 0 to disable
    /// (overrides FILE_GATEWAY_SESSION_IDLE_SECS)
    #[arg(long)]
    pub session_idle_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |name| env::var(name))?;
        Ok((cfg, migrate))
    }

    /// CLI values win over the environment, which wins over defaults.
    fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let text = |name: &str, default: &str| -> Result<String> {
            match lookup(name) {
                Ok(value) => Ok(value),
                Err(env::VarError::NotPresent) => Ok(default.to_string()),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };
        let optional = |name: &str| -> Result<Option<String>> {
            match lookup(name) {
                Ok(value) if value.trim().is_empty() => Ok(None),
                Ok(value) => Ok(Some(value)),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", name)),
            }
        };

        // --- Environment fallback ---
        let env_port = parsed(&optional, "FILE_GATEWAY_PORT")?.unwrap_or(8080);
        let env_depth = parsed(&optional, "FILE_GATEWAY_MAX_PATH_DEPTH")?.unwrap_or(2);
        let env_body =
            parsed(&optional, "FILE_GATEWAY_MAX_BODY_BYTES")?.unwrap_or(DEFAULT_MAX_BODY_BYTES);
        let env_idle = parsed(&optional, "FILE_GATEWAY_SESSION_IDLE_SECS")?
            .unwrap_or(DEFAULT_SESSION_IDLE_SECS);
        let env_seven_zip = match optional("FILE_GATEWAY_SEVEN_ZIP")? {
            Some(value) => <SevenZipMode as ValueEnum>::from_str(value.trim(), true)
                .map_err(|e| anyhow!(e))
                .with_context(|| format!("parsing FILE_GATEWAY_SEVEN_ZIP value `{}`", value))?,
            None => SevenZipMode::Auto,
        };

        // --- Merge ---
        Ok(Self {
            host: match args.host {
                Some(host) => host,
                None => text("FILE_GATEWAY_HOST", "0.0.0.0")?,
            },
            port: args.port.unwrap_or(env_port),
            storage_dir: match args.storage_dir {
                Some(dir) => dir,
                None => text("FILE_GATEWAY_STORAGE_DIR", "./data/objects")?,
            },
            scratch_dir: match args.scratch_dir {
                Some(dir) => dir,
                None => text("FILE_GATEWAY_SCRATCH_DIR", "./data/scratch")?,
            },
            database_url: match args.database_url {
                Some(url) => url,
                None => text("FILE_GATEWAY_DATABASE_URL", "sqlite://./data/meta/files.db")?,
            },
            public_base_url: match args.public_base_url {
                Some(url) => Some(url),
                None => optional("FILE_GATEWAY_PUBLIC_BASE_URL")?,
            },
            max_path_depth: args.max_path_depth.unwrap_or(env_depth),
            seven_zip: args.seven_zip.unwrap_or(env_seven_zip),
            seven_zip_bin: match args.seven_zip_bin {
                Some(bin) => bin,
                None => text("FILE_GATEWAY_SEVEN_ZIP_BIN", "7z")?,
            },
            max_body_bytes: args.max_body_bytes.unwrap_or(env_body),
            session_idle_secs: args.session_idle_secs.unwrap_or(env_idle),
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parsed<T, F>(optional: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Result<Option<String>>,
{
    match optional(name)? {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_flags() {
        let cfg = AppConfig::merge(Args::default(), lookup(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:8080");
        assert_eq!(cfg.storage_dir, "./data/objects");
        assert_eq!(cfg.scratch_dir, "./data/scratch");
        assert_eq!(cfg.database_url, "sqlite://./data/meta/files.db");
        assert_eq!(cfg.public_base_url, None);
        assert_eq!(cfg.max_path_depth, 2);
        assert_eq!(cfg.seven_zip, SevenZipMode::Auto);
        assert_eq!(cfg.seven_zip_bin, "7z");
        assert_eq!(cfg.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert_eq!(cfg.session_idle_secs, DEFAULT_SESSION_IDLE_SECS);
    }

    #[test]
    fn flags_override_environment() {
        let env = lookup(&[
            ("FILE_GATEWAY_PORT", "9000"),
            ("FILE_GATEWAY_HOST", "127.0.0.1"),
            ("FILE_GATEWAY_SEVEN_ZIP", "External"),
            ("FILE_GATEWAY_PUBLIC_BASE_URL", "https://files.example.com"),
            ("FILE_GATEWAY_SESSION_IDLE_SECS", "600"),
        ]);
        let args = Args {
            port: Some(9100),
            ..Args::default()
        };
        let cfg = AppConfig::merge(args, env).unwrap();
        assert_eq!(cfg.session_idle_secs, 600);
        assert_eq!(cfg.addr(), "127.0.0.1:9100");
        assert_eq!(cfg.seven_zip, SevenZipMode::External);
        assert_eq!(cfg.public_base_url.as_deref(), Some("https://files.example.com"));
    }

    #[test]
    fn malformed_numbers_are_startup_errors() {
        let err = AppConfig::merge(Args::default(), lookup(&[("FILE_GATEWAY_PORT", "eighty")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("FILE_GATEWAY_PORT"));

        let err = AppConfig::merge(Args::default(), lookup(&[("FILE_GATEWAY_SEVEN_ZIP", "rar")]))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("FILE_GATEWAY_SEVEN_ZIP"));
    }
}
