//! Runtime configuration.
//!
//! Parameters arrive as `KEY=value` strings before init, either one at a
//! time or as `KEY=value SUBKEY=value ...` tuples describing a group, store
//! or checkpoint descriptor. A bare `KEY` queries the stored value and
//! `KEY=` removes it. Environment variables supply defaults for any key not
//! set explicitly; explicit values win.
//!
//! Configuration strings must be identical on all ranks; init broadcasts
//! the resolved parameter set from rank 0 and compares.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{bail, format_err, Error};
use nom::bytes::complete::{take_while, take_while1};
use nom::character::complete::char;
use nom::combinator::{all_consuming, opt};
use nom::multi::separated_list1;
use nom::sequence::{delimited, preceded, tuple};

use scr_api_types::CopyType;

use crate::mover::XferKind;

pub const KEY_ENABLE: &str = "SCR_ENABLE";
pub const KEY_DEBUG: &str = "SCR_DEBUG";
pub const KEY_PREFIX: &str = "SCR_PREFIX";
pub const KEY_CNTL_BASE: &str = "SCR_CNTL_BASE";
pub const KEY_CACHE_BASE: &str = "SCR_CACHE_BASE";
pub const KEY_CACHE_SIZE: &str = "SCR_CACHE_SIZE";
pub const KEY_CACHE_BYPASS: &str = "SCR_CACHE_BYPASS";
pub const KEY_COPY_TYPE: &str = "SCR_COPY_TYPE";
pub const KEY_SET_SIZE: &str = "SCR_SET_SIZE";
pub const KEY_SET_FAILURES: &str = "SCR_SET_FAILURES";
pub const KEY_GROUP: &str = "SCR_GROUP";
pub const KEY_HALT_SECONDS: &str = "SCR_HALT_SECONDS";
pub const KEY_HALT_EXIT: &str = "SCR_HALT_EXIT";
pub const KEY_FLUSH: &str = "SCR_FLUSH";
pub const KEY_FLUSH_ASYNC: &str = "SCR_FLUSH_ASYNC";
pub const KEY_FLUSH_TYPE: &str = "SCR_FLUSH_TYPE";
pub const KEY_FLUSH_ON_RESTART: &str = "SCR_FLUSH_ON_RESTART";
pub const KEY_FETCH: &str = "SCR_FETCH";
pub const KEY_FETCH_BYPASS: &str = "SCR_FETCH_BYPASS";
pub const KEY_FETCH_CURRENT: &str = "SCR_CURRENT";
pub const KEY_GLOBAL_RESTART: &str = "SCR_GLOBAL_RESTART";
pub const KEY_DISTRIBUTE: &str = "SCR_DISTRIBUTE";
pub const KEY_PREFIX_SIZE: &str = "SCR_PREFIX_SIZE";
pub const KEY_PREFIX_PURGE: &str = "SCR_PREFIX_PURGE";
pub const KEY_PURGE: &str = "SCR_PURGE";
pub const KEY_CRC_ON_COPY: &str = "SCR_CRC_ON_COPY";
pub const KEY_CRC_ON_FLUSH: &str = "SCR_CRC_ON_FLUSH";
pub const KEY_CRC_ON_DELETE: &str = "SCR_CRC_ON_DELETE";
pub const KEY_CHECKPOINT_INTERVAL: &str = "SCR_CHECKPOINT_INTERVAL";
pub const KEY_CHECKPOINT_SECONDS: &str = "SCR_CHECKPOINT_SECONDS";
pub const KEY_CHECKPOINT_OVERHEAD: &str = "SCR_CHECKPOINT_OVERHEAD";
pub const KEY_MPI_BUF_SIZE: &str = "SCR_MPI_BUF_SIZE";
pub const KEY_FILE_BUF_SIZE: &str = "SCR_FILE_BUF_SIZE";
pub const KEY_COPY_METADATA: &str = "SCR_COPY_METADATA";
pub const KEY_DROP_AFTER_CURRENT: &str = "SCR_DROP_AFTER_CURRENT";
pub const KEY_END_TIME: &str = "SCR_END_TIME";
pub const KEY_JOB_ID: &str = "SCR_JOB_ID";
pub const KEY_JOB_NAME: &str = "SCR_JOB_NAME";
pub const KEY_CLUSTER_NAME: &str = "SCR_CLUSTER_NAME";

/// Keys that accumulate one entry per primary value instead of replacing.
const MULTI_VALUE_KEYS: &[&str] = &["STORE", "CKPT", "GROUPS"];

type Subkeys = BTreeMap<String, String>;

/// Pre-init parameter store.
///
/// A three-level tree: key, primary value, subkey/value pairs. Plain
/// parameters occupy a single value with no subkeys; descriptor tuples
/// (`STORE`, `CKPT`, `GROUPS`) keep one entry per primary value.
#[derive(Clone, Debug, Default)]
pub struct Config {
    tree: BTreeMap<String, BTreeMap<String, Subkeys>>,
}

fn ident(i: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_')(i)
}

fn value(i: &str) -> nom::IResult<&str, &str> {
    take_while(|c: char| !c.is_whitespace())(i)
}

fn spaces(i: &str) -> nom::IResult<&str, &str> {
    take_while(|c: char| c.is_whitespace())(i)
}

fn spaces1(i: &str) -> nom::IResult<&str, &str> {
    take_while1(|c: char| c.is_whitespace())(i)
}

type Entry<'a> = (&'a str, Option<&'a str>);

fn entry(i: &str) -> nom::IResult<&str, Entry> {
    tuple((ident, opt(preceded(char('='), value))))(i)
}

fn parse_entries(input: &str) -> Result<Vec<Entry>, Error> {
    let parser = delimited(spaces, separated_list1(spaces1, entry), spaces);
    match all_consuming(parser)(input) {
        Ok((_, entries)) => Ok(entries),
        Err(err) => bail!("unable to parse config string '{}' - {}", input, err),
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    /// Apply one configuration string.
    ///
    /// `KEY=value [SUBKEY=value ...]` sets, `KEY=` unsets, and a bare `KEY`
    /// queries; queries return the stored value, everything else `None`.
    pub fn apply(&mut self, input: &str) -> Result<Option<String>, Error> {
        let entries = parse_entries(input)?;
        let (key, first_value) = entries[0];

        match first_value {
            None => {
                if entries.len() > 1 {
                    bail!("config query '{}' takes a single key", input);
                }
                Ok(self.get(key).map(String::from))
            }
            Some("") if entries.len() == 1 => {
                self.tree.remove(key);
                Ok(None)
            }
            Some(primary) => {
                let mut subkeys = Subkeys::new();
                for (subkey, subvalue) in &entries[1..] {
                    match subvalue {
                        Some(subvalue) => {
                            subkeys.insert(subkey.to_string(), subvalue.to_string());
                        }
                        None => bail!("subkey '{}' in '{}' needs a value", subkey, input),
                    }
                }

                let values = self.tree.entry(key.to_string()).or_default();
                if !MULTI_VALUE_KEYS.contains(&key) {
                    values.clear();
                }
                values
                    .entry(primary.to_string())
                    .or_default()
                    .extend(subkeys);
                Ok(None)
            }
        }
    }

    /// Builder-style setter for a plain key.
    pub fn set(mut self, key: &str, value: &str) -> Self {
        let values = self.tree.entry(key.to_string()).or_default();
        if !MULTI_VALUE_KEYS.contains(&key) {
            values.clear();
        }
        values.entry(value.to_string()).or_default();
        self
    }

    /// Value of a plain key, if set.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.tree
            .get(key)
            .and_then(|values| values.keys().next())
            .map(String::as_str)
    }

    /// All entries stored under a multi-value key: (primary value, subkeys).
    pub fn entries(&self, key: &str) -> Vec<(&str, &Subkeys)> {
        match self.tree.get(key) {
            Some(values) => values
                .iter()
                .map(|(value, subkeys)| (value.as_str(), subkeys))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Group attribute values for this process, from the `GROUPS` entry
    /// matching its hostname. Values may legitimately differ across ranks.
    pub fn group_attrs(&self, hostname: &str) -> Subkeys {
        self.tree
            .get("GROUPS")
            .and_then(|values| values.get(hostname))
            .cloned()
            .unwrap_or_default()
    }

    /// Value of `key`, falling back to the environment variable of the
    /// same name.
    pub fn param(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(value) => Some(value.to_string()),
            None => std::env::var(key).ok(),
        }
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, Error> {
    match value {
        "1" | "true" | "TRUE" | "yes" | "YES" => Ok(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Ok(false),
        other => bail!("invalid boolean '{}' for {}", other, key),
    }
}

fn param_bool(config: &Config, key: &str, default: bool) -> Result<bool, Error> {
    match config.param(key) {
        Some(value) => parse_bool(key, &value),
        None => Ok(default),
    }
}

fn param_u64(config: &Config, key: &str, default: u64) -> Result<u64, Error> {
    match config.param(key) {
        Some(value) => value
            .parse()
            .map_err(|err| format_err!("invalid value '{}' for {} - {}", value, key, err)),
        None => Ok(default),
    }
}

fn param_f64(config: &Config, key: &str, default: f64) -> Result<f64, Error> {
    match config.param(key) {
        Some(value) => value
            .parse()
            .map_err(|err| format_err!("invalid value '{}' for {} - {}", value, key, err)),
        None => Ok(default),
    }
}

/// Fully resolved parameters. The shared and scheme-determining members
/// must be identical on every rank and are verified by broadcast at init;
/// node-local storage paths may differ per node.
#[derive(Clone, Debug)]
pub struct Params {
    pub enabled: bool,
    pub debug: u64,
    pub prefix: PathBuf,
    pub cntl_base: PathBuf,
    pub cache_base: PathBuf,
    pub cache_size: usize,
    pub cache_bypass: bool,
    pub copy_type: CopyType,
    pub set_size: usize,
    pub set_failures: usize,
    pub group: String,
    pub halt_seconds: i64,
    pub halt_exit: bool,
    /// Flush every N checkpoints; 0 disables periodic flushing.
    pub flush: u64,
    pub flush_async: bool,
    pub flush_type: XferKind,
    pub flush_on_restart: bool,
    pub fetch: bool,
    pub fetch_bypass: bool,
    pub fetch_current: Option<String>,
    pub global_restart: bool,
    pub distribute: bool,
    /// Retention window of pure checkpoints in the prefix directory; 0 keeps all.
    pub prefix_size: usize,
    pub prefix_purge: bool,
    pub purge: bool,
    pub crc_on_copy: bool,
    pub crc_on_flush: bool,
    pub crc_on_delete: bool,
    pub checkpoint_interval: u64,
    pub checkpoint_seconds: u64,
    pub checkpoint_overhead: f64,
    pub mpi_buf_size: usize,
    pub file_buf_size: usize,
    pub copy_metadata: bool,
    pub drop_after_current: bool,
    pub end_time: Option<i64>,
    pub jobid: Option<String>,
    pub jobname: Option<String>,
    pub cluster: Option<String>,
}

impl Params {
    /// Resolve the parameter set from explicit configuration plus the
    /// environment. Called on every rank; rank 0's copy is authoritative.
    pub fn from_config(config: &Config) -> Result<Params, Error> {
        let prefix = match config.param(KEY_PREFIX) {
            Some(value) => PathBuf::from(value),
            None => std::env::current_dir()
                .map_err(|err| format_err!("unable to determine working directory - {}", err))?,
        };
        if !prefix.is_absolute() {
            bail!("{} must be an absolute path - got {:?}", KEY_PREFIX, prefix);
        }

        let cntl_base = PathBuf::from(
            config
                .param(KEY_CNTL_BASE)
                .unwrap_or_else(|| "/dev/shm".to_string()),
        );
        let cache_base = match config.param(KEY_CACHE_BASE) {
            Some(value) => PathBuf::from(value),
            None => cntl_base.clone(),
        };

        let copy_type = match config.param(KEY_COPY_TYPE) {
            Some(value) => value
                .parse()
                .map_err(|err| format_err!("invalid {} '{}' - {}", KEY_COPY_TYPE, value, err))?,
            None => CopyType::Xor,
        };

        let flush_type = match config.param(KEY_FLUSH_TYPE) {
            Some(value) => value
                .parse()
                .map_err(|err: Error| format_err!("invalid {} - {}", KEY_FLUSH_TYPE, err))?,
            None => XferKind::Sync,
        };

        let cache_bypass = param_bool(config, KEY_CACHE_BYPASS, true)?;
        let fetch_bypass = param_bool(config, KEY_FETCH_BYPASS, cache_bypass)?;

        let end_time = match config.param(KEY_END_TIME) {
            Some(value) => Some(
                value
                    .parse()
                    .map_err(|err| format_err!("invalid {} '{}' - {}", KEY_END_TIME, value, err))?,
            ),
            None => None,
        };

        Ok(Params {
            enabled: param_bool(config, KEY_ENABLE, true)?,
            debug: param_u64(config, KEY_DEBUG, 0)?,
            prefix,
            cntl_base,
            cache_base,
            cache_size: param_u64(config, KEY_CACHE_SIZE, 1)? as usize,
            cache_bypass,
            copy_type,
            set_size: param_u64(config, KEY_SET_SIZE, 8)? as usize,
            set_failures: param_u64(config, KEY_SET_FAILURES, 2)? as usize,
            group: config
                .param(KEY_GROUP)
                .unwrap_or_else(|| "NODE".to_string()),
            halt_seconds: param_u64(config, KEY_HALT_SECONDS, 0)? as i64,
            halt_exit: param_bool(config, KEY_HALT_EXIT, true)?,
            flush: param_u64(config, KEY_FLUSH, 10)?,
            flush_async: param_bool(config, KEY_FLUSH_ASYNC, false)?,
            flush_type,
            flush_on_restart: param_bool(config, KEY_FLUSH_ON_RESTART, false)?,
            fetch: param_bool(config, KEY_FETCH, true)?,
            fetch_bypass,
            fetch_current: config.param(KEY_FETCH_CURRENT),
            global_restart: param_bool(config, KEY_GLOBAL_RESTART, false)?,
            distribute: param_bool(config, KEY_DISTRIBUTE, true)?,
            prefix_size: param_u64(config, KEY_PREFIX_SIZE, 0)? as usize,
            prefix_purge: param_bool(config, KEY_PREFIX_PURGE, false)?,
            purge: param_bool(config, KEY_PURGE, false)?,
            crc_on_copy: param_bool(config, KEY_CRC_ON_COPY, false)?,
            crc_on_flush: param_bool(config, KEY_CRC_ON_FLUSH, true)?,
            crc_on_delete: param_bool(config, KEY_CRC_ON_DELETE, false)?,
            checkpoint_interval: param_u64(config, KEY_CHECKPOINT_INTERVAL, 0)?,
            checkpoint_seconds: param_u64(config, KEY_CHECKPOINT_SECONDS, 0)?,
            checkpoint_overhead: param_f64(config, KEY_CHECKPOINT_OVERHEAD, 0.0)?,
            mpi_buf_size: param_u64(config, KEY_MPI_BUF_SIZE, 128 * 1024)? as usize,
            file_buf_size: param_u64(config, KEY_FILE_BUF_SIZE, 1024 * 1024)? as usize,
            copy_metadata: param_bool(config, KEY_COPY_METADATA, false)?,
            drop_after_current: param_bool(config, KEY_DROP_AFTER_CURRENT, false)?,
            end_time,
            jobid: config.param(KEY_JOB_ID),
            jobname: config.param(KEY_JOB_NAME),
            cluster: config.param(KEY_CLUSTER_NAME),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_query_unset() -> Result<(), Error> {
        let mut config = Config::new();

        assert_eq!(config.apply("SCR_FLUSH=5")?, None);
        assert_eq!(config.apply("SCR_FLUSH")?, Some("5".to_string()));

        // replace, query, unset, query
        config.apply("SCR_FLUSH=7")?;
        assert_eq!(config.apply("SCR_FLUSH")?, Some("7".to_string()));
        config.apply("SCR_FLUSH=")?;
        assert_eq!(config.apply("SCR_FLUSH")?, None);
        Ok(())
    }

    #[test]
    fn descriptor_tuples_accumulate() -> Result<(), Error> {
        let mut config = Config::new();
        config.apply("STORE=/dev/shm GROUP=NODE COUNT=2")?;
        config.apply("STORE=/p/bb TYPE=pthread COUNT=4")?;
        config.apply("CKPT=0 INTERVAL=1 TYPE=XOR SET_SIZE=4")?;

        let stores = config.entries("STORE");
        assert_eq!(stores.len(), 2);
        assert_eq!(stores[0].0, "/dev/shm");
        assert_eq!(stores[0].1.get("COUNT").map(String::as_str), Some("2"));
        assert_eq!(stores[1].1.get("TYPE").map(String::as_str), Some("pthread"));

        let ckpts = config.entries("CKPT");
        assert_eq!(ckpts.len(), 1);
        assert_eq!(ckpts[0].1.get("SET_SIZE").map(String::as_str), Some("4"));
        Ok(())
    }

    #[test]
    fn rejects_malformed() {
        let mut config = Config::new();
        assert!(config.apply("").is_err());
        assert!(config.apply("KEY SUB=1").is_err());
        assert!(config.apply("KEY=1 SUB").is_err());
    }

    #[test]
    fn params_defaults() -> Result<(), Error> {
        let config = Config::new().set(KEY_PREFIX, "/pfs/run1");
        let params = Params::from_config(&config)?;
        assert!(params.enabled);
        assert_eq!(params.copy_type, CopyType::Xor);
        assert_eq!(params.cache_size, 1);
        assert_eq!(params.flush, 10);
        assert!(params.cache_bypass);
        assert!(params.fetch_bypass);
        assert_eq!(params.prefix, PathBuf::from("/pfs/run1"));
        Ok(())
    }

    #[test]
    fn params_overrides() -> Result<(), Error> {
        let config = Config::new()
            .set(KEY_PREFIX, "/pfs/run1")
            .set(KEY_COPY_TYPE, "PARTNER")
            .set(KEY_CACHE_BYPASS, "0")
            .set(KEY_SET_SIZE, "4")
            .set(KEY_PREFIX_SIZE, "2");
        let params = Params::from_config(&config)?;
        assert_eq!(params.copy_type, CopyType::Partner);
        assert!(!params.cache_bypass);
        assert!(!params.fetch_bypass);
        assert_eq!(params.set_size, 4);
        assert_eq!(params.prefix_size, 2);
        Ok(())
    }
}
