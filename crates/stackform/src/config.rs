//! Environment specific configuration.
//!
//! Each environment has its own `configuration-{environment}.toml` holding a
//! single `[main]` table:
//!
//! ```toml
//! [main]
//! namespace = "demo"
//! env = "dev"
//! aws_region = "us-east-1"
//! aws_account_id = "123456789012"
//! # ...
//! ```
//!
//! The file is read once, validated, and the resulting [`Config`] is never
//! mutated afterwards.
use std::path::{Path, PathBuf};

use snafu::prelude::*;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid environment '{environment}': no configuration file at {path:?}"))]
    MissingEnvironment {
        environment: String,
        path: PathBuf,
    },

    #[snafu(display("Could not read configuration file {path:?}: {source}"))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Could not parse configuration for '{environment}': {source}"))]
    Parse {
        environment: String,
        source: toml::de::Error,
    },

    #[snafu(display("Configuration for '{environment}' has no [main] section"))]
    MissingSection { environment: String },

    #[snafu(display("Configuration for '{environment}' is missing field '{field}'"))]
    MissingField {
        environment: String,
        field: &'static str,
    },

    #[snafu(display("Configuration for '{environment}' has an invalid '{field}': {reason}"))]
    InvalidField {
        environment: String,
        field: &'static str,
        reason: String,
    },
}

type Result<T, E = Error> = core::result::Result<T, E>;

/// Which container image the application service runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageChoice {
    /// The public ECS sample image, used before the first pipeline run has
    /// pushed anything to the registry.
    Bootstrap,
    /// The image tagged with the environment name in our own registry.
    #[default]
    Versioned,
}

impl core::fmt::Display for ImageChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ImageChoice::Bootstrap => "bootstrap",
            ImageChoice::Versioned => "versioned",
        })
    }
}

/// Account and region every stack is deployed to.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Environment {
    pub account: String,
    pub region: String,
}

/// The `[main]` table as written, before validation.
#[derive(serde::Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    namespace: Option<String>,
    aws_region: Option<String>,
    aws_account_id: Option<String>,
    github_repo_name: Option<String>,
    github_owner: Option<String>,
    git_branch: Option<String>,
    secrets_manager_github_token: Option<String>,
    container_port: Option<i64>,
    listener_port: Option<i64>,
    health_check_path: Option<String>,
    health_check_secure_token: Option<String>,
    env: Option<String>,
    ecr_repo_name: Option<String>,
    db_name: Option<String>,
    db_username: Option<String>,
    db_password: Option<String>,
    db_port: Option<i64>,
    image: Option<ImageChoice>,
}

#[derive(serde::Deserialize)]
struct ConfigFile {
    main: Option<RawConfig>,
}

/// Validated settings for one environment.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    pub namespace: String,

    pub aws_region: String,
    pub aws_account_id: String,

    pub github_repo_name: String,
    pub github_owner: String,
    pub git_branch: String,
    /// Name of the Secrets Manager secret holding the GitHub OAuth token.
    pub secrets_manager_github_token: String,

    pub container_port: u16,
    pub listener_port: u16,
    pub health_check_path: String,
    pub health_check_secure_token: Option<String>,
    pub env: String,

    pub ecr_repo_name: String,

    pub db_name: String,
    pub db_username: String,
    pub db_password: String,
    pub db_port: u16,

    pub image: ImageChoice,
}

impl core::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("namespace", &self.namespace)
            .field("aws_region", &self.aws_region)
            .field("aws_account_id", &self.aws_account_id)
            .field("github_repo_name", &self.github_repo_name)
            .field("github_owner", &self.github_owner)
            .field("git_branch", &self.git_branch)
            .field(
                "secrets_manager_github_token",
                &self.secrets_manager_github_token,
            )
            .field("container_port", &self.container_port)
            .field("listener_port", &self.listener_port)
            .field("health_check_path", &self.health_check_path)
            .field(
                "health_check_secure_token",
                &self.health_check_secure_token.as_ref().map(|_| "<redacted>"),
            )
            .field("env", &self.env)
            .field("ecr_repo_name", &self.ecr_repo_name)
            .field("db_name", &self.db_name)
            .field("db_username", &self.db_username)
            .field("db_password", &"<redacted>")
            .field("db_port", &self.db_port)
            .field("image", &self.image)
            .finish()
    }
}

/// The path of the configuration file for `environment` inside `dir`.
pub fn config_file_path(environment: &str, dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join(format!("configuration-{environment}.toml"))
}

/// Validates fields of one [`RawConfig`], remembering which environment it
/// belongs to for error messages.
struct Validator<'a> {
    environment: &'a str,
}

impl Validator<'_> {
    fn required<T>(&self, field: &'static str, value: Option<T>) -> Result<T> {
        value.context(MissingFieldSnafu {
            environment: self.environment,
            field,
        })
    }

    fn invalid<T>(&self, field: &'static str, reason: impl Into<String>) -> Result<T> {
        InvalidFieldSnafu {
            environment: self.environment,
            field,
            reason: reason.into(),
        }
        .fail()
    }

    fn text(&self, field: &'static str, value: Option<String>) -> Result<String> {
        let value = self.required(field, value)?;
        if value.trim().is_empty() {
            return self.invalid(field, "must not be empty");
        }
        Ok(value)
    }

    /// A value that ends up inside resource names.
    fn name(&self, field: &'static str, value: Option<String>) -> Result<String> {
        let value = self.text(field, value)?;
        if !value
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return self.invalid(
                field,
                format!("'{value}' may only contain lowercase letters, digits and '-'"),
            );
        }
        Ok(value)
    }

    fn port(&self, field: &'static str, value: Option<i64>) -> Result<u16> {
        let value = self.required(field, value)?;
        match u16::try_from(value) {
            Ok(port) if port > 0 => Ok(port),
            _ => self.invalid(field, format!("{value} is not a port in 1..=65535")),
        }
    }

    fn account_id(&self, field: &'static str, value: Option<String>) -> Result<String> {
        let value = self.text(field, value)?;
        if value.len() != 12 || !value.chars().all(|c| c.is_ascii_digit()) {
            return self.invalid(field, format!("'{value}' is not a 12 digit account id"));
        }
        Ok(value)
    }

    fn path(&self, field: &'static str, value: Option<String>) -> Result<String> {
        let value = self.text(field, value)?;
        if !value.starts_with('/') {
            return self.invalid(field, format!("'{value}' must start with '/'"));
        }
        Ok(value)
    }
}

impl Config {
    /// Loads the configuration of `environment` from `dir`.
    pub fn load(environment: &str, dir: impl AsRef<Path>) -> Result<Self> {
        let path = config_file_path(environment, dir);
        ensure!(
            path.is_file(),
            MissingEnvironmentSnafu {
                environment,
                path: path.clone(),
            }
        );
        log::debug!("reading configuration for '{environment}' from {path:?}");
        let contents = std::fs::read_to_string(&path).context(ReadSnafu { path: path.clone() })?;
        let config = Self::from_toml_str(environment, &contents)?;
        log::trace!("loaded {config:?}");
        Ok(config)
    }

    /// Parses and validates configuration text for `environment`.
    pub fn from_toml_str(environment: &str, contents: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents).context(ParseSnafu { environment })?;
        let raw = file.main.context(MissingSectionSnafu { environment })?;
        let v = Validator { environment };

        let health_check_secure_token = match raw.health_check_secure_token {
            Some(token) if token.trim().is_empty() => {
                return v.invalid("health_check_secure_token", "must not be empty when set")
            }
            token => token,
        };

        Ok(Config {
            namespace: v.name("namespace", raw.namespace)?,
            aws_region: v.name("aws_region", raw.aws_region)?,
            aws_account_id: v.account_id("aws_account_id", raw.aws_account_id)?,
            github_repo_name: v.text("github_repo_name", raw.github_repo_name)?,
            github_owner: v.text("github_owner", raw.github_owner)?,
            git_branch: v.text("git_branch", raw.git_branch)?,
            secrets_manager_github_token: v
                .text("secrets_manager_github_token", raw.secrets_manager_github_token)?,
            container_port: v.port("container_port", raw.container_port)?,
            listener_port: v.port("listener_port", raw.listener_port)?,
            health_check_path: v.path("health_check_path", raw.health_check_path)?,
            health_check_secure_token,
            env: v.name("env", raw.env)?,
            ecr_repo_name: v.name("ecr_repo_name", raw.ecr_repo_name)?,
            db_name: v.text("db_name", raw.db_name)?,
            db_username: v.text("db_username", raw.db_username)?,
            db_password: v.text("db_password", raw.db_password)?,
            db_port: v.port("db_port", raw.db_port)?,
            image: raw.image.unwrap_or_default(),
        })
    }

    /// The namespace shared by every stack of this environment,
    /// `{namespace}-{env}`.
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.namespace, self.env)
    }

    pub fn environment(&self) -> Environment {
        Environment {
            account: self.aws_account_id.clone(),
            region: self.aws_region.clone(),
        }
    }

    /// Returns a copy running `image` instead of the configured one.
    pub fn with_image(mut self, image: ImageChoice) -> Self {
        self.image = image;
        self
    }
}

#[cfg(test)]
pub(crate) mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    pub(crate) const DEV: &str = r#"
[main]
namespace = "demo"
env = "dev"
aws_region = "us-east-1"
aws_account_id = "123456789012"
github_repo_name = "demo-backend"
github_owner = "demo-org"
git_branch = "main"
secrets_manager_github_token = "github-token"
container_port = 8000
listener_port = 80
health_check_path = "/health/"
ecr_repo_name = "demo-backend"
db_name = "demo"
db_username = "demo_admin"
db_password = "placeholder"
db_port = 5432
"#;

    pub(crate) fn dev_config() -> Config {
        Config::from_toml_str("dev", DEV).unwrap()
    }

    fn without(field: &str) -> String {
        DEV.lines()
            .filter(|line| !line.starts_with(&format!("{field} =")))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn parses_every_field() {
        let config = dev_config();
        assert_eq!("demo-dev", config.namespace());
        assert_eq!(8000, config.container_port);
        assert_eq!(5432, config.db_port);
        assert_eq!(ImageChoice::Versioned, config.image);
        assert_eq!(None, config.health_check_secure_token);
        assert_eq!(
            Environment {
                account: "123456789012".to_owned(),
                region: "us-east-1".to_owned(),
            },
            config.environment()
        );
    }

    #[test]
    fn missing_field_is_named() {
        let err = Config::from_toml_str("dev", &without("db_port")).unwrap_err();
        assert!(
            matches!(&err, Error::MissingField { environment, field: "db_port" } if environment == "dev"),
            "{err}"
        );
    }

    #[test]
    fn invalid_fields_are_named() {
        let contents = DEV.replace("listener_port = 80", "listener_port = 70000");
        let err = Config::from_toml_str("dev", &contents).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "listener_port", .. }));

        let contents = DEV.replace("\"123456789012\"", "\"1234\"");
        let err = Config::from_toml_str("dev", &contents).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "aws_account_id", .. }));

        let contents = DEV.replace("\"/health/\"", "\"health\"");
        let err = Config::from_toml_str("dev", &contents).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "health_check_path", .. }));

        let contents = DEV.replace("namespace = \"demo\"", "namespace = \"Demo App\"");
        let err = Config::from_toml_str("dev", &contents).unwrap_err();
        assert!(matches!(err, Error::InvalidField { field: "namespace", .. }));
    }

    #[test]
    fn unknown_fields_and_sections_are_rejected() {
        let err = Config::from_toml_str("dev", &format!("{DEV}\nmystery = 1\n")).unwrap_err();
        assert!(matches!(err, Error::Parse { .. }), "{err}");

        let err = Config::from_toml_str("dev", "[other]\nnamespace = \"demo\"\n").unwrap_err();
        assert!(matches!(err, Error::MissingSection { .. }), "{err}");
    }

    #[test]
    fn image_choice_is_read() {
        let contents = format!("{DEV}image = \"bootstrap\"\n");
        let config = Config::from_toml_str("dev", &contents).unwrap();
        assert_eq!(ImageChoice::Bootstrap, config.image);
        assert_eq!(
            ImageChoice::Versioned,
            config.with_image(ImageChoice::Versioned).image
        );
    }

    #[test]
    fn debug_redacts_secrets() {
        let debug = format!("{:?}", dev_config());
        assert!(!debug.contains("placeholder"), "{debug}");
        assert!(debug.contains("<redacted>"));
    }

    #[test]
    fn load_reads_environment_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(config_file_path("dev", dir.path()), DEV).unwrap();
        let config = Config::load("dev", dir.path()).unwrap();
        assert_eq!(dev_config(), config);
    }

    #[test]
    fn load_unknown_environment_names_it() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load("staging", dir.path()).unwrap_err();
        assert!(
            matches!(&err, Error::MissingEnvironment { environment, .. } if environment == "staging")
        );
        assert!(err.to_string().contains("staging"));
    }
}
