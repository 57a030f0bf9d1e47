/// Rate limiting and bans.
///
/// Three mechanisms, all in-memory:
///
///  - connection admission: a per-IP sliding 60-second window. A denied
///    attempt is not recorded, so a client retrying against a full window
///    gains slots as old admissions age out.
///  - message rate: a per-session token bucket (capacity `msg_burst`,
///    refill `msg_per_sec`). A message that finds no token is dropped.
///  - bans: per-IP entries with an expiry. Admin bans and automatic bans
///    (after `auto_ban` message-rate violations) share one table. A ban is
///    never shortened by a later ban; only an explicit unban clears early.
///
/// Per-IP map entries expire with their contents: drained connection
/// windows and quiet violation counters are swept out periodically, so
/// traffic from many distinct addresses cannot grow the maps without
/// bound.
///
/// Internals take an explicit `now: Instant` so tests can drive the clock.
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Mutex, OnceLock, RwLock};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::RateConfig;
use crate::registry::SessionRegistry;

const CONN_WINDOW: Duration = Duration::from_secs(60);
/// Violation counters that stay below the auto-ban threshold are forgotten
/// after this long without a new violation.
const VIOLATION_TTL: Duration = Duration::from_secs(10 * 60);

/// Who imposed a ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BanReason {
    Auto,
    Admin,
}

#[derive(Debug, Clone, Copy)]
struct BanEntry {
    expires: Instant,
    reason: BanReason,
}

/// Serializable view of one ban, for `GET /bans`.
#[derive(Debug, Clone, Serialize)]
pub struct BanInfo {
    pub ip: String,
    pub reason: BanReason,
    pub remaining_secs: u64,
}

/// Per-session message token bucket.
#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Sub-threshold violation count with its last-seen time, for expiry.
#[derive(Debug, Clone, Copy)]
struct ViolationCounter {
    count: u32,
    updated: Instant,
}

/// Shared rate limiter. One instance per proxy process.
#[derive(Debug, Default)]
pub struct RateLimiter {
    cfg: RwLock<RateConfig>,
    conn_windows: Mutex<HashMap<IpAddr, VecDeque<Instant>>>,
    buckets: Mutex<HashMap<u64, TokenBucket>>,
    violations: Mutex<HashMap<IpAddr, ViolationCounter>>,
    bans: Mutex<HashMap<IpAddr, BanEntry>>,
    last_sweep: Mutex<Option<Instant>>,
    // The registry is created after the limiter and wired in once at startup,
    // so bans can terminate live sessions.
    registry: OnceLock<Arc<SessionRegistry>>,
}

impl RateLimiter {
    pub fn new(cfg: RateConfig) -> Self {
        Self {
            cfg: RwLock::new(cfg),
            ..Self::default()
        }
    }

    /// Wire in the session registry. Called once during startup.
    pub fn attach_registry(&self, registry: Arc<SessionRegistry>) {
        let _ = self.registry.set(registry);
    }

    /// Current thresholds.
    pub fn config(&self) -> RateConfig {
        *self.cfg.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace thresholds at runtime. New values apply to subsequent checks;
    /// existing bans keep their original expiry.
    pub fn set_config(&self, cfg: RateConfig) {
        *self.cfg.write().unwrap_or_else(|e| e.into_inner()) = cfg;
        info!(?cfg, "rate limit thresholds updated");
    }

    // ── Bans ─────────────────────────────────────────────────────

    pub fn is_banned(&self, ip: IpAddr) -> bool {
        self.is_banned_at(ip, Instant::now())
    }

    fn is_banned_at(&self, ip: IpAddr, now: Instant) -> bool {
        let mut bans = self.bans.lock().unwrap_or_else(|e| e.into_inner());
        match bans.get(&ip) {
            Some(entry) if entry.expires > now => true,
            Some(_) => {
                bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    /// Ban `ip` for the configured duration and close its live sessions.
    /// If the address is already banned, the expiry only ever extends.
    pub fn ban(&self, ip: IpAddr, reason: BanReason) {
        let duration = Duration::from_secs(self.config().ban_duration_min * 60);
        self.ban_for(ip, reason, duration);
    }

    /// Ban with an explicit duration (admin bans may override the default).
    pub fn ban_for(&self, ip: IpAddr, reason: BanReason, duration: Duration) {
        self.ban_at(ip, reason, duration, Instant::now());
        if let Some(registry) = self.registry.get() {
            let closed = registry.close_ip(ip);
            if closed > 0 {
                info!(%ip, closed, "closed sessions for banned address");
            }
        }
    }

    fn ban_at(&self, ip: IpAddr, reason: BanReason, duration: Duration, now: Instant) {
        let expires = now + duration;
        let mut bans = self.bans.lock().unwrap_or_else(|e| e.into_inner());
        let entry = bans.entry(ip).or_insert(BanEntry { expires, reason });
        if expires > entry.expires {
            entry.expires = expires;
            entry.reason = reason;
        }
        warn!(%ip, ?reason, secs = duration.as_secs(), "address banned");
    }

    /// Lift a ban. Returns false if the address was not banned.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let removed = self
            .bans
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&ip)
            .is_some();
        if removed {
            self.violations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&ip);
            info!(%ip, "ban lifted");
        }
        removed
    }

    /// Snapshot active bans, pruning expired entries.
    pub fn bans(&self) -> Vec<BanInfo> {
        self.bans_at(Instant::now())
    }

    fn bans_at(&self, now: Instant) -> Vec<BanInfo> {
        let mut bans = self.bans.lock().unwrap_or_else(|e| e.into_inner());
        bans.retain(|_, entry| entry.expires > now);
        let mut infos: Vec<BanInfo> = bans
            .iter()
            .map(|(ip, entry)| BanInfo {
                ip: ip.to_string(),
                reason: entry.reason,
                remaining_secs: entry.expires.duration_since(now).as_secs(),
            })
            .collect();
        infos.sort_by(|a, b| a.ip.cmp(&b.ip));
        infos
    }

    // ── Connection admission ─────────────────────────────────────

    /// Admit or deny a new connection from `ip`. Denials are not recorded
    /// and do not count toward auto-ban.
    pub fn allow_connection(&self, ip: IpAddr) -> bool {
        self.allow_connection_at(ip, Instant::now())
    }

    fn allow_connection_at(&self, ip: IpAddr, now: Instant) -> bool {
        self.maybe_sweep(now);
        let limit = self.config().conn_per_min as usize;
        let mut windows = self.conn_windows.lock().unwrap_or_else(|e| e.into_inner());
        let window = windows.entry(ip).or_default();

        while let Some(&front) = window.front() {
            if now.duration_since(front) >= CONN_WINDOW {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= limit {
            return false;
        }
        window.push_back(now);
        true
    }

    // ── Message rate ─────────────────────────────────────────────

    /// Create the token bucket for a new session, starting full.
    pub fn open_session(&self, session_id: u64) {
        self.open_session_at(session_id, Instant::now());
    }

    fn open_session_at(&self, session_id: u64, now: Instant) {
        let burst = self.config().msg_burst as f64;
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                session_id,
                TokenBucket {
                    tokens: burst,
                    last_refill: now,
                },
            );
    }

    /// Drop the bucket when the session ends.
    pub fn close_session(&self, session_id: u64) {
        self.buckets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&session_id);
    }

    /// Take one token for an inbound message. False means the message
    /// must be dropped and a violation recorded by the caller.
    pub fn allow_message(&self, session_id: u64) -> bool {
        self.allow_message_at(session_id, Instant::now())
    }

    fn allow_message_at(&self, session_id: u64, now: Instant) -> bool {
        let cfg = self.config();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let Some(bucket) = buckets.get_mut(&session_id) else {
            // Unknown session: nothing to meter, let the message pass.
            return true;
        };

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * cfg.msg_per_sec as f64).min(cfg.msg_burst as f64);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Record one message-rate violation for `ip`. Returns true when the
    /// violation tripped an automatic ban.
    pub fn record_violation(&self, ip: IpAddr) -> bool {
        self.record_violation_at(ip, Instant::now())
    }

    fn record_violation_at(&self, ip: IpAddr, now: Instant) -> bool {
        let threshold = self.config().auto_ban;
        if threshold == 0 {
            // Auto-ban disabled; violations are dropped messages only.
            return false;
        }
        self.maybe_sweep(now);

        let tripped = {
            let mut violations = self.violations.lock().unwrap_or_else(|e| e.into_inner());
            let counter = violations.entry(ip).or_insert(ViolationCounter {
                count: 0,
                updated: now,
            });
            counter.count += 1;
            counter.updated = now;
            if counter.count >= threshold {
                violations.remove(&ip);
                true
            } else {
                false
            }
        };

        if tripped {
            self.ban(ip, BanReason::Auto);
        }
        tripped
    }

    /// Evict idle per-IP state, at most once per [`CONN_WINDOW`].
    fn maybe_sweep(&self, now: Instant) {
        {
            let mut last = self.last_sweep.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(prev) = *last {
                if now.duration_since(prev) < CONN_WINDOW {
                    return;
                }
            }
            *last = Some(now);
        }

        self.conn_windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, window| {
                while let Some(&front) = window.front() {
                    if now.duration_since(front) >= CONN_WINDOW {
                        window.pop_front();
                    } else {
                        break;
                    }
                }
                !window.is_empty()
            });

        self.violations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, counter| now.duration_since(counter.updated) < VIOLATION_TTL);
    }
}
