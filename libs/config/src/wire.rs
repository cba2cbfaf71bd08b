use std::{path::PathBuf, time::Duration};

use anyhow::{Context, Result, bail};
use courier_core::buffer::OverflowPolicy;
use serde::{Deserialize, Deserializer, Serialize, de};

/// top-level config type
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub servers: Option<MaybeList<String>>,
    pub name: Option<String>,
    #[serde(default)]
    pub no_echo: bool,
    pub credentials_path: Option<PathBuf>,
    /// bytes, or "unbounded"
    pub reconnect_buffer_bytes: Option<Limit>,
    /// entries, or "unbounded"
    pub reconnect_buffer_entries: Option<Limit>,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// attempts, or "unbounded" to retry until closed
    pub max_reconnect_attempts: Option<Limit>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub reconnect_wait: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub max_reconnect_wait: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub connect_timeout: Option<Duration>,
    pub connect_retry_max: Option<u32>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub ping_interval: Option<Duration>,
    pub max_pings_out: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_optional_duration")]
    pub request_timeout: Option<Duration>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MaybeList<T> {
    Val(T),
    List(Vec<T>),
}

impl<T> MaybeList<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            MaybeList::Val(v) => vec![v],
            MaybeList::List(v) => v,
        }
    }
}

/// A count that may be lifted entirely.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum Limit {
    Count(usize),
    Keyword(String),
}

impl Limit {
    /// `None` means no limit
    pub fn get(&self) -> Result<Option<usize>> {
        match self {
            Limit::Count(n) => Ok(Some(*n)),
            Limit::Keyword(k) if k == "unbounded" => Ok(None),
            Limit::Keyword(k) => bail!("expected a number or 'unbounded', got '{k}'"),
        }
    }
}

/// Parse a duration string with optional time units
/// Accepts: "250ms", "5s", "1m", "2h"
/// If no unit is specified, assumes milliseconds
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration string");
    }

    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    // split units
    let (num, unit) = s.split_at(end);
    let num = num.parse::<u64>().context("invalid number")?;

    let millis_per_unit = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => bail!(
            "unknown time unit '{}', only 'h', 'm', 's' or 'ms' are supported",
            other
        ),
    };

    num.checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .context("duration value overflow")
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireDuration {
    Millis(u64),
    String(String),
}

impl WireDuration {
    fn into_duration<E: de::Error>(self) -> Result<Duration, E> {
        match self {
            WireDuration::Millis(ms) => Ok(Duration::from_millis(ms)),
            WireDuration::String(s) => parse_duration(&s).map_err(E::custom),
        }
    }
}

fn deserialize_optional_duration<'de, D>(de: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<WireDuration>::deserialize(de)?
        .map(WireDuration::into_duration)
        .transpose()
}
