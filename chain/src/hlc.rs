//! Hybrid logical clock timestamps and the per-node clock.
//!
//! An HLC timestamp is a lexicographically comparable string of the form
//! `"<ISO-8601 with nanoseconds>_<logical counter>"`, for example
//! `"2024-01-15T12:00:00.000000000Z_0"`. Byte-wise string comparison is the
//! ordering used everywhere: in the processing queue, in the validation
//! queue, and for block heights (which are the nanosecond value of the
//! timestamp part).
//!
//! The clock itself ([`HlcClock`]) issues timestamps that are strictly
//! greater than anything it has previously issued or observed. Monotonicity
//! is a per-process invariant only; cross-node ordering comes from
//! consensus, not from clocks.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Fixed timestamp carried by the genesis block.
///
/// It sorts before every real timestamp and is never parsed for
/// nanoseconds; genesis has block number 0 by definition.
pub const GENESIS_HLC: &str = "0000-00-00T00:00:00.000000000Z_0";

/// An HLC timestamp.
///
/// Wraps the canonical string form. Ordering, equality, and hashing all
/// operate on the raw string, which makes `Hlc` usable directly as an
/// ordered map key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Hlc(String);

impl Hlc {
    /// Wraps a raw timestamp string without validating it.
    pub fn new(raw: impl Into<String>) -> Self {
        Hlc(raw.into())
    }

    /// The fixed genesis timestamp.
    pub fn genesis() -> Self {
        Hlc(GENESIS_HLC.to_string())
    }

    /// Returns the raw string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns `true` if this looks like a well-formed HLC timestamp:
    /// a parseable ISO-8601 instant, an underscore, and a decimal counter.
    pub fn is_valid(&self) -> bool {
        let Some((wall, counter)) = self.0.rsplit_once('_') else {
            return false;
        };
        if counter.is_empty() || !counter.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
        DateTime::parse_from_rfc3339(wall).is_ok()
    }

    /// The wall-clock part of the timestamp, without the logical counter.
    pub fn wall(&self) -> &str {
        self.0.rsplit_once('_').map(|(w, _)| w).unwrap_or(&self.0)
    }

    /// Nanoseconds since the Unix epoch of the wall-clock part.
    ///
    /// The logical counter suffix is ignored. Unparseable timestamps
    /// (including the genesis sentinel) yield 0, mirroring how block
    /// number 0 is reserved for genesis.
    pub fn nanos(&self) -> u64 {
        let Ok(dt) = DateTime::parse_from_rfc3339(self.wall()) else {
            return 0;
        };
        let secs = dt.timestamp();
        if secs < 0 {
            return 0;
        }
        secs as u64 * 1_000_000_000 + dt.timestamp_subsec_nanos() as u64
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Hlc {
    fn from(raw: &str) -> Self {
        Hlc::new(raw)
    }
}

/// Per-node hybrid logical clock.
///
/// Issues strictly increasing timestamps and absorbs timestamps observed
/// from peers so that the next issued timestamp is greater than anything
/// seen so far.
#[derive(Debug, Default)]
pub struct HlcClock {
    last: Option<Hlc>,
}

impl HlcClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh timestamp strictly greater than any previously issued
    /// or observed one.
    ///
    /// If the wall clock has advanced past the last-seen wall part, the new
    /// timestamp adopts it with counter 0; otherwise the last-seen wall
    /// part is reused and the logical counter incremented.
    pub fn now(&mut self) -> Hlc {
        let wall = Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true);

        let next = match &self.last {
            Some(last) if wall.as_str() <= last.wall() => {
                let counter: u64 = last
                    .as_str()
                    .rsplit_once('_')
                    .and_then(|(_, c)| c.parse().ok())
                    .unwrap_or(0);
                Hlc(format!("{}_{}", last.wall(), counter + 1))
            }
            _ => Hlc(format!("{wall}_0")),
        };

        self.last = Some(next.clone());
        next
    }

    /// Advances the internal last-seen timestamp to `observed` if it is
    /// newer. Called for every timestamp received from a peer.
    pub fn merge(&mut self, observed: &Hlc) {
        match &self.last {
            Some(last) if last >= observed => {}
            _ => self.last = Some(observed.clone()),
        }
    }

    /// The most recent timestamp issued or observed, if any.
    pub fn last_seen(&self) -> Option<&Hlc> {
        self.last.as_ref()
    }
}
