//! Config file loading.
//!
//! The config is a single YAML file naming the serving addresses, the local
//! index path, the bucket credentials, admission limits, the signer's
//! cadence and the per-log key material. See `config.example.yml` for an
//! annotated example.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, NaiveDateTime, Utc};
use ed25519_dalek::pkcs8::{DecodePrivateKey, DecodePublicKey};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::Deserialize;

use crate::admin::{AdminTable, SignatureAlgorithm, Tree, TreeState};

#[derive(Debug, Default, Deserialize)]
struct File {
    #[serde(default)]
    metrics_addr: String,
    #[serde(default)]
    server_addr: String,
    #[serde(default)]
    cert_file: String,
    #[serde(default)]
    key_file: String,

    #[serde(default)]
    db_path: String,

    #[serde(default)]
    b2_acct_id: String,
    #[serde(default)]
    b2_app_key: String,
    #[serde(default)]
    b2_bucket: String,
    #[serde(default)]
    b2_url: String,

    #[serde(default)]
    max_unsequenced_leaves: i64,
    #[serde(default)]
    max_clients: usize,
    #[serde(default)]
    request_timeout: String,

    #[serde(default)]
    signer: SignerFile,
    #[serde(default)]
    logs: Vec<LogFile>,
}

#[derive(Debug, Default, Deserialize)]
struct SignerFile {
    #[serde(default)]
    batch_size: usize,
    #[serde(default)]
    run_interval: String,
    #[serde(default)]
    guard_window: String,
}

#[derive(Debug, Default, Deserialize)]
struct LogFile {
    #[serde(default)]
    log_id: i64,
    #[serde(default)]
    create_time: String,
    #[serde(default)]
    update_time: String,

    #[serde(default)]
    tree_state: String,
    #[serde(default)]
    sig_alg: String,
    #[serde(default)]
    max_root_duration: String,

    #[serde(default)]
    not_after_start: String,
    #[serde(default)]
    not_after_stop: String,

    #[serde(default)]
    prefix: String,
    #[serde(default)]
    roots_file: String,

    #[serde(default)]
    pub_key: String,
    #[serde(default)]
    priv_key: String,
}

#[derive(Debug)]
pub struct Config {
    pub metrics_addr: String,
    pub server_addr: String,
    pub cert_file: String,
    pub key_file: String,

    pub db_path: PathBuf,

    pub b2_acct_id: String,
    pub b2_app_key: String,
    pub b2_bucket: String,
    pub b2_url: String,

    pub max_unsequenced_leaves: i64,
    pub max_clients: usize,
    pub request_timeout: Duration,

    pub signer: SignerConfig,
    pub logs: Vec<LogConfig>,
    pub trees: Vec<Tree>,
}

#[derive(Clone, Debug)]
pub struct SignerConfig {
    pub batch_size: usize,
    pub run_interval: Duration,
    pub guard_window: Duration,
}

/// Serving-side configuration of one log.
#[derive(Clone, Debug)]
pub struct LogConfig {
    pub log_id: i64,
    pub prefix: String,
    pub roots_file: String,
    pub not_after_start: Option<DateTime<Utc>>,
    pub not_after_stop: Option<DateTime<Utc>>,
    pub public_key_pem: String,
    pub private_key_pem: String,
}

impl LogConfig {
    pub fn public_key(&self) -> anyhow::Result<VerifyingKey> {
        VerifyingKey::from_public_key_pem(&self.public_key_pem)
            .map_err(|err| anyhow!("failed to parse public key: {err}"))
    }

    pub fn signing_key(&self) -> anyhow::Result<SigningKey> {
        SigningKey::from_pkcs8_pem(&self.private_key_pem)
            .map_err(|err| anyhow!("failed to parse private key: {err}"))
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Config> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        Config::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> anyhow::Result<Config> {
        let parsed: File = serde_yaml::from_str(raw)?;

        if parsed.metrics_addr.is_empty() {
            bail!("no address to serve metrics on was found in config file");
        } else if parsed.server_addr.is_empty() {
            bail!("no address for the server to listen on was found in config file");
        }

        if parsed.db_path.is_empty() {
            bail!("local database path not found in config file");
        } else if parsed.b2_acct_id.is_empty() {
            bail!("no backblaze account id found in config file");
        } else if parsed.b2_app_key.is_empty() {
            bail!("no backblaze application key found in config file");
        } else if parsed.b2_bucket.is_empty() {
            bail!("no backblaze bucket found in config file");
        } else if parsed.b2_url.is_empty() {
            bail!("no backblaze download url found in config file");
        }

        if parsed.max_unsequenced_leaves < 1 {
            bail!("max_unsequenced_leaves must be positive");
        } else if parsed.max_clients < 1 {
            bail!("max_clients cannot be less than one");
        }
        let request_timeout =
            parse_duration(&parsed.request_timeout).context("failed to parse request timeout")?;

        if parsed.logs.is_empty() {
            bail!("no logs found in config file");
        }
        for (i, log) in parsed.logs.iter().enumerate() {
            if log.log_id <= 0 {
                bail!("log #{} in config file: log cannot have id {}", i + 1, log.log_id);
            }
            for (j, other) in parsed.logs[i + 1..].iter().enumerate() {
                if log.log_id == other.log_id {
                    bail!(
                        "logs #{} and #{} in config file have the same log id",
                        i + 1,
                        i + j + 2,
                    );
                }
            }
        }

        let signer = SignerConfig {
            batch_size: parsed.signer.batch_size,
            run_interval: parse_duration(&parsed.signer.run_interval)
                .context("failed to parse signer run interval")?,
            guard_window: parse_duration(&parsed.signer.guard_window)
                .context("failed to parse signer guard window")?,
        };

        let mut logs = Vec::with_capacity(parsed.logs.len());
        let mut trees = Vec::with_capacity(parsed.logs.len());
        for (i, meta) in parsed.logs.iter().enumerate() {
            logs.push(log_config(meta).with_context(|| format!("log #{} in config file", i + 1))?);
            trees.push(read_tree(meta).with_context(|| format!("log #{} in config file", i + 1))?);
        }

        Ok(Config {
            metrics_addr: parsed.metrics_addr,
            server_addr: parsed.server_addr,
            cert_file: parsed.cert_file,
            key_file: parsed.key_file,

            db_path: PathBuf::from(parsed.db_path),

            b2_acct_id: expand_env(&parsed.b2_acct_id),
            b2_app_key: expand_env(&parsed.b2_app_key),
            b2_bucket: expand_env(&parsed.b2_bucket),
            b2_url: expand_env(&parsed.b2_url),

            max_unsequenced_leaves: parsed.max_unsequenced_leaves,
            max_clients: parsed.max_clients,
            request_timeout,

            signer,
            logs,
            trees,
        })
    }

    pub fn admin_table(&self) -> AdminTable {
        AdminTable::new(self.trees.clone())
    }
}

fn log_config(meta: &LogFile) -> anyhow::Result<LogConfig> {
    let public_key_pem = expand_env(&meta.pub_key);
    let private_key_pem = expand_env(&meta.priv_key);
    if public_key_pem.is_empty() {
        bail!("no public key found");
    } else if private_key_pem.is_empty() {
        bail!("no private key found");
    }

    let (not_after_start, not_after_stop) =
        if meta.not_after_start.is_empty() && meta.not_after_stop.is_empty() {
            (None, None)
        } else {
            (
                Some(parse_time(&meta.not_after_start)?),
                Some(parse_time(&meta.not_after_stop)?),
            )
        };

    Ok(LogConfig {
        log_id: meta.log_id,
        prefix: meta.prefix.clone(),
        roots_file: meta.roots_file.clone(),
        not_after_start,
        not_after_stop,
        public_key_pem,
        private_key_pem,
    })
}

fn read_tree(meta: &LogFile) -> anyhow::Result<Tree> {
    let state = match meta.tree_state.as_str() {
        "ACTIVE" => TreeState::Active,
        "FROZEN" => TreeState::Frozen,
        other => bail!("unknown tree state: {other}"),
    };
    let signature_algorithm = match meta.sig_alg.as_str() {
        "ECDSA" => SignatureAlgorithm::Ecdsa,
        "ED25519" => SignatureAlgorithm::Ed25519,
        other => bail!("unknown signature algorithm: {other}"),
    };
    let max_root_duration =
        parse_duration(&meta.max_root_duration).context("failed to parse max root duration")?;
    let create_time = parse_time(&meta.create_time).context("failed to parse create time")?;
    let update_time = parse_time(&meta.update_time).context("failed to parse update time")?;

    Ok(Tree {
        tree_id: meta.log_id,
        state,
        signature_algorithm,
        max_root_duration,
        create_time,
        update_time,
    })
}

/// Parses `30s`, `250ms`, `1h30m` and friends.
fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| anyhow!("missing unit in duration {raw:?}"))?;
        if number_end == 0 {
            bail!("invalid duration {raw:?}");
        }
        let value: f64 = rest[..number_end]
            .parse()
            .with_context(|| format!("invalid duration {raw:?}"))?;
        rest = &rest[number_end..];

        let (seconds_per_unit, unit_len) = if rest.starts_with("ns") {
            (1e-9, 2)
        } else if rest.starts_with("us") {
            (1e-6, 2)
        } else if rest.starts_with("ms") {
            (1e-3, 2)
        } else if rest.starts_with('s') {
            (1.0, 1)
        } else if rest.starts_with('m') {
            (60.0, 1)
        } else if rest.starts_with('h') {
            (3600.0, 1)
        } else {
            bail!("unknown unit in duration {raw:?}");
        };
        total += Duration::from_secs_f64(value * seconds_per_unit);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Parses `"2019-01-02 15:04:05 UTC"`. Stored times pin UTC; other zone
/// names are rejected rather than silently misread.
fn parse_time(raw: &str) -> anyhow::Result<DateTime<Utc>> {
    let (stamp, zone) = raw
        .trim()
        .rsplit_once(' ')
        .ok_or_else(|| anyhow!("invalid time {raw:?}"))?;
    if zone != "UTC" && zone != "GMT" {
        bail!("unsupported time zone {zone:?} in {raw:?}");
    }
    let naive = NaiveDateTime::parse_from_str(stamp, "%Y-%m-%d %H:%M:%S")
        .with_context(|| format!("invalid time {raw:?}"))?;
    Ok(naive.and_utc())
}

/// Replaces `$VAR` and `${VAR}` with the environment's values; unset
/// variables expand to the empty string.
fn expand_env(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(at) = rest.find('$') {
        out.push_str(&rest[..at]);
        rest = &rest[at + 1..];

        if let Some(braced) = rest.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                out.push_str(&std::env::var(&braced[..end]).unwrap_or_default());
                rest = &braced[end + 1..];
            } else {
                out.push_str("${");
                rest = braced;
            }
            continue;
        }

        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end == 0 {
            out.push('$');
            continue;
        }
        out.push_str(&std::env::var(&rest[..end]).unwrap_or_default());
        rest = &rest[end..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> String {
        r#"
metrics_addr: "127.0.0.1:8081"
server_addr: "127.0.0.1:8080"
db_path: "/var/lib/ctlog/index.redb"
b2_acct_id: "acct"
b2_app_key: "key"
b2_bucket: "ct-leaves"
b2_url: "https://example.com/file/ct-leaves"
max_unsequenced_leaves: 100000
max_clients: 128
request_timeout: "30s"
signer:
  batch_size: 512
  run_interval: "5s"
  guard_window: "1s"
logs:
  - log_id: 1
    prefix: "/logs/test"
    roots_file: "roots.pem"
    tree_state: "ACTIVE"
    sig_alg: "ED25519"
    max_root_duration: "1h"
    create_time: "2019-01-02 15:04:05 UTC"
    update_time: "2019-01-02 15:04:05 UTC"
    pub_key: "pem-public"
    priv_key: "pem-private"
"#
        .to_string()
    }

    #[test]
    fn test_parse_full_config() {
        let config = Config::from_yaml(&sample_yaml()).unwrap();
        assert_eq!(config.server_addr, "127.0.0.1:8080");
        assert_eq!(config.db_path, PathBuf::from("/var/lib/ctlog/index.redb"));
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.signer.batch_size, 512);
        assert_eq!(config.signer.run_interval, Duration::from_secs(5));
        assert_eq!(config.logs.len(), 1);
        assert_eq!(config.logs[0].prefix, "/logs/test");
        assert_eq!(config.trees[0].tree_id, 1);
        assert_eq!(config.trees[0].state, TreeState::Active);
        assert_eq!(config.trees[0].max_root_duration, Duration::from_secs(3600));
        assert_eq!(config.admin_table().active_log_ids(), [1]);
    }

    #[test]
    fn test_missing_required_fields() {
        let without_server = sample_yaml().replace("server_addr", "other_addr");
        let err = Config::from_yaml(&without_server).unwrap_err();
        assert!(err.to_string().contains("no address for the server"));

        let without_bucket = sample_yaml().replace("b2_bucket", "other_bucket");
        assert!(Config::from_yaml(&without_bucket).is_err());

        let zero_quota = sample_yaml().replace("max_unsequenced_leaves: 100000", "max_unsequenced_leaves: 0");
        let err = Config::from_yaml(&zero_quota).unwrap_err();
        assert!(err.to_string().contains("must be positive"));
    }

    #[test]
    fn test_duplicate_log_ids() {
        let extra = r#"
  - log_id: 1
    prefix: "/logs/dup"
    roots_file: "roots.pem"
    tree_state: "ACTIVE"
    sig_alg: "ED25519"
    max_root_duration: "1h"
    create_time: "2019-01-02 15:04:05 UTC"
    update_time: "2019-01-02 15:04:05 UTC"
    pub_key: "pem-public"
    priv_key: "pem-private"
"#;
        let doubled = sample_yaml() + extra;
        let err = Config::from_yaml(&doubled).unwrap_err();
        assert!(err.to_string().contains("same log id"));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(90 * 60),
        );
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("5parsecs").is_err());
    }

    #[test]
    fn test_parse_time() {
        let when = parse_time("2019-01-02 15:04:05 UTC").unwrap();
        assert_eq!(when.timestamp(), 1546441445);
        assert!(parse_time("2019-01-02 15:04:05 PST").is_err());
        assert!(parse_time("2019-01-02").is_err());
    }

    #[test]
    fn test_expand_env() {
        std::env::set_var("CTLOG_TEST_VALUE", "sekrit");
        assert_eq!(expand_env("$CTLOG_TEST_VALUE"), "sekrit");
        assert_eq!(expand_env("a-${CTLOG_TEST_VALUE}-b"), "a-sekrit-b");
        assert_eq!(expand_env("$CTLOG_TEST_UNSET_VALUE"), "");
        assert_eq!(expand_env("no dollars"), "no dollars");
    }
}
