//! Hybrid Logical Clock: a timestamp combining physical time, a logical
//! counter, and node identity so that events across peers can be totally
//! ordered even under clock skew.
//!
//! `Hlc` is the wire/data-model value (§3 of the design). `Clock` is the
//! stateful generator a node runs locally: it hands out `Hlc`s via `now()`,
//! folds in timestamps observed from peers via `observe()`, and defends
//! against the clock running backward or a counter overflowing within one
//! millisecond.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context};
use chrono::TimeZone;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, SyncError};

/// Hybrid Logical Clock timestamp: `(physical_ms, counter, node_id)`.
///
/// `Ord`/`PartialOrd` are derived, and because Rust compares struct fields in
/// declaration order, this gives exactly the lexicographic ordering over
/// `(physical_ms, counter, node_id)` the design calls for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Hlc {
    pub physical_ms: u64,
    pub counter: u32,
    pub node_id: Uuid,
}

impl Hlc {
    /// The smallest possible HLC; used as the open lower bound before any
    /// record has ever been written, and as the zero value for `sync_lo` when
    /// two nodes have never synced.
    pub const MIN: Hlc = Hlc {
        physical_ms: 0,
        counter: 0,
        node_id: Uuid::nil(),
    };

    /// The largest representable HLC; used as a closed upper bound when a
    /// caller wants "every row up to the present", since the engine has no
    /// open-ended range query.
    pub fn max() -> Hlc {
        Hlc {
            physical_ms: u64::MAX,
            counter: u32::MAX,
            node_id: Uuid::from_bytes([0xffu8; 16]),
        }
    }

    /// Encodes this HLC in the canonical wire representation from §6:
    /// `{u64 physical_ms}{u32 counter}{16 bytes node_id}`, big-endian.
    pub fn to_bytes(self) -> [u8; 28] {
        let mut buf = [0u8; 28];
        buf[0..8].copy_from_slice(&self.physical_ms.to_be_bytes());
        buf[8..12].copy_from_slice(&self.counter.to_be_bytes());
        buf[12..28].copy_from_slice(self.node_id.as_bytes());
        buf
    }

    /// (I2)'s conflict tie-break: the greater `modified_hlc` wins; on a full
    /// tie (same `physical_ms` and `counter` but different `node_id`, which
    /// can happen when two nodes stamp independently in the same
    /// millisecond), the *smaller* `node_id` wins. This deliberately does
    /// not delegate to `Hlc`'s derived `Ord`, which orders by node_id
    /// ascending on a tie and would pick the wrong winner here.
    pub fn resolves_conflict_over(&self, other: &Hlc) -> bool {
        match self.physical_ms.cmp(&other.physical_ms) {
            Ordering::Greater => true,
            Ordering::Less => false,
            Ordering::Equal => match self.counter.cmp(&other.counter) {
                Ordering::Greater => true,
                Ordering::Less => false,
                Ordering::Equal => self.node_id < other.node_id,
            },
        }
    }

    pub fn from_bytes(buf: &[u8]) -> anyhow::Result<Hlc> {
        if buf.len() != 28 {
            bail!("HLC wire payload must be 28 bytes, got {}", buf.len());
        }
        let physical_ms = u64::from_be_bytes(buf[0..8].try_into().unwrap());
        let counter = u32::from_be_bytes(buf[8..12].try_into().unwrap());
        let node_id = Uuid::from_slice(&buf[12..28]).context("invalid node_id bytes in HLC")?;
        Ok(Hlc {
            physical_ms,
            counter,
            node_id,
        })
    }
}

impl fmt::Display for Hlc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:08x}-{}", self.physical_ms, self.counter, self.node_id)
    }
}

impl FromStr for Hlc {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.splitn(3, '-').collect();
        if parts.len() != 3 {
            bail!("invalid HLC string '{}', expected 'physical_ms-counterHex-node_id'", s);
        }
        let physical_ms = parts[0]
            .parse::<u64>()
            .with_context(|| format!("invalid physical_ms in HLC '{}'", s))?;
        let counter = u32::from_str_radix(parts[1], 16)
            .with_context(|| format!("invalid counter hex in HLC '{}'", s))?;
        let node_id =
            Uuid::parse_str(parts[2]).with_context(|| format!("invalid node_id in HLC '{}'", s))?;
        Ok(Hlc {
            physical_ms,
            counter,
            node_id,
        })
    }
}

impl Hlc {
    /// Formats `physical_ms` as an RFC3339 UTC timestamp with millisecond
    /// precision, for human-readable audit logging (e.g. the Calibrator's
    /// emergency-recalibration log lines). Purely cosmetic — ordering and
    /// hashing never go through this.
    pub fn physical_ms_rfc3339(&self) -> anyhow::Result<String> {
        hlc_millis_to_rfc3339(self.physical_ms)
    }
}

/// Converts a Unix millisecond timestamp into an RFC3339 UTC string.
pub fn hlc_millis_to_rfc3339(millis: u64) -> anyhow::Result<String> {
    let secs = (millis / 1000) as i64;
    let nanos = ((millis % 1000) * 1_000_000) as u32;
    match chrono::Utc.timestamp_opt(secs, nanos) {
        chrono::LocalResult::Single(dt) => Ok(dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)),
        _ => bail!("HLC millisecond timestamp out of range: {}", millis),
    }
}

fn current_utc_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

struct ClockState {
    last_local_hlc: Hlc,
    master_offset_ms: i64,
    /// Set while absorbing a non-fatal backward jump (§4.1): `physical_ms`
    /// stays pinned at `last_local_hlc.physical_ms` until wall time rises
    /// back past it, then eases forward by at most `catchup_step_ms` per
    /// `now()` call instead of snapping straight to the true wall-clock
    /// reading, so downstream consumers never see a sudden large jump right
    /// after a recovered outage.
    catching_up: bool,
}

/// Local HLC generator for one node. Thread-safe: `now()`/`observe()` take an
/// internal lock held only for the duration of the computation, matching the
/// single-writer-many-reader shape the design gives `NodeMetadata`.
pub struct Clock {
    node_id: Uuid,
    state: Mutex<ClockState>,
    backward_fatal_ms: i64,
    catchup_step_ms: i64,
}

impl Clock {
    pub fn new(node_id: Uuid, backward_fatal_ms: i64, catchup_step_ms: i64) -> Self {
        Clock {
            node_id,
            state: Mutex::new(ClockState {
                last_local_hlc: Hlc {
                    physical_ms: 0,
                    counter: 0,
                    node_id,
                },
                master_offset_ms: 0,
                catching_up: false,
            }),
            backward_fatal_ms,
            catchup_step_ms,
        }
    }

    /// Restores a clock from persisted `NodeMetadata` (last_local_hlc,
    /// master_offset_ms) so a restarted node doesn't regress its own HLC.
    pub fn restore(
        node_id: Uuid,
        last_local_hlc: Hlc,
        master_offset_ms: i64,
        backward_fatal_ms: i64,
        catchup_step_ms: i64,
    ) -> Self {
        Clock {
            node_id,
            state: Mutex::new(ClockState {
                last_local_hlc,
                master_offset_ms,
                catching_up: false,
            }),
            backward_fatal_ms,
            catchup_step_ms,
        }
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn master_offset_ms(&self) -> i64 {
        self.state.lock().unwrap().master_offset_ms
    }

    pub fn set_master_offset_ms(&self, offset_ms: i64) {
        self.state.lock().unwrap().master_offset_ms = offset_ms;
    }

    pub fn last_local_hlc(&self) -> Hlc {
        self.state.lock().unwrap().last_local_hlc
    }

    /// Returns the next local HLC, per §4.1.
    ///
    /// Backward-jump protection: if wall-clock time appears to have moved
    /// backward relative to what we last issued against, a jump over
    /// `backward_fatal_ms` fails outright. A smaller jump is absorbed:
    /// `physical_ms` stays pinned at its last value (only `counter`
    /// advances) until wall time rises back past it, and from then on
    /// `physical_ms` is eased forward by at most `catchup_step_ms` per call
    /// rather than snapping straight to the true wall-clock reading, so a
    /// recovered clock never hands out a single large forward discontinuity.
    pub fn now(&self) -> Result<Hlc> {
        let mut state = self.state.lock().unwrap();
        let wall_ms = current_utc_ms();

        // The wall-clock time implied by the last HLC we issued.
        let last_emitted_wall_ms = state.last_local_hlc.physical_ms as i64 - state.master_offset_ms;
        let jump_ms = last_emitted_wall_ms - wall_ms;
        if jump_ms > self.backward_fatal_ms {
            return Err(SyncError::ClockBackwardFatal {
                jump_ms,
                limit_ms: self.backward_fatal_ms,
            });
        }
        if jump_ms > 0 {
            state.catching_up = true;
        }

        let true_phys = (wall_ms + state.master_offset_ms).max(0) as u64;
        let phys = if state.catching_up {
            if true_phys >= state.last_local_hlc.physical_ms {
                let eased = state
                    .last_local_hlc
                    .physical_ms
                    .saturating_add(self.catchup_step_ms.max(0) as u64)
                    .min(true_phys);
                if eased >= true_phys {
                    state.catching_up = false;
                }
                eased
            } else {
                // Still behind the pinned mark; stay put until wall time rises back to it.
                state.last_local_hlc.physical_ms
            }
        } else {
            true_phys
        };

        let (physical_ms, counter) = match phys.cmp(&state.last_local_hlc.physical_ms) {
            Ordering::Greater => (phys, 0u32),
            _ => {
                let counter = state
                    .last_local_hlc
                    .counter
                    .checked_add(1)
                    .ok_or(SyncError::ClockOverflow)?;
                (state.last_local_hlc.physical_ms, counter)
            }
        };

        let hlc = Hlc {
            physical_ms,
            counter,
            node_id: self.node_id,
        };
        state.last_local_hlc = hlc;
        Ok(hlc)
    }

    /// Merges an incoming HLC into the local clock, per §4.1.
    pub fn observe(&self, remote: Hlc) -> Result<Hlc> {
        let mut state = self.state.lock().unwrap();
        let wall_ms = current_utc_ms();
        let local_phys = (wall_ms + state.master_offset_ms).max(0) as u64;

        let max_phys = local_phys
            .max(state.last_local_hlc.physical_ms)
            .max(remote.physical_ms);

        let counter = if max_phys == state.last_local_hlc.physical_ms && max_phys == remote.physical_ms {
            state
                .last_local_hlc
                .counter
                .max(remote.counter)
                .checked_add(1)
                .ok_or(SyncError::ClockOverflow)?
        } else if max_phys == state.last_local_hlc.physical_ms {
            state
                .last_local_hlc
                .counter
                .checked_add(1)
                .ok_or(SyncError::ClockOverflow)?
        } else if max_phys == remote.physical_ms {
            remote.counter.checked_add(1).ok_or(SyncError::ClockOverflow)?
        } else {
            0
        };

        let hlc = Hlc {
            physical_ms: max_phys,
            counter,
            node_id: self.node_id,
        };
        state.last_local_hlc = hlc;
        Ok(hlc)
    }
}
