use std::{
    collections::HashMap,
    net::IpAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::{Duration, Instant},
};

use crate::config::{normalize_origin, GatewayConfig};

/// Fixed-window message budget.
pub struct MessageWindow {
    max_messages: u32,
    window: Duration,
    window_start: Instant,
    count: u32,
}

impl MessageWindow {
    pub fn new(max_messages: u32, window: Duration) -> Self {
        Self {
            max_messages,
            window,
            window_start: Instant::now(),
            count: 0,
        }
    }

    pub fn per_minute(max_messages: u32) -> Self {
        Self::new(max_messages, Duration::from_secs(60))
    }

    pub fn admit(&mut self) -> bool {
        self.admit_at(Instant::now())
    }

    fn admit_at(&mut self, now: Instant) -> bool {
        if self.elapsed(now) {
            self.window_start = now;
            self.count = 0;
        }
        self.count = self.count.saturating_add(1);
        self.count <= self.max_messages
    }

    fn elapsed(&self, now: Instant) -> bool {
        now.duration_since(self.window_start) >= self.window
    }
}

/// Per-IP budget for WebSocket upgrades. At most `max_addrs` addresses are
/// tracked; when full, addresses whose window has elapsed are evicted first.
pub struct UpgradeLimiter {
    max_upgrades: u32,
    window: Duration,
    max_addrs: usize,
    windows: Mutex<HashMap<IpAddr, MessageWindow>>,
}

impl UpgradeLimiter {
    pub fn new(max_upgrades: u32, window: Duration, max_addrs: usize) -> Self {
        Self {
            max_upgrades,
            window,
            max_addrs,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);

        if windows.len() >= self.max_addrs && !windows.contains_key(&ip) {
            windows.retain(|_, window| !window.elapsed(now));
            if windows.len() >= self.max_addrs {
                return false;
            }
        }

        windows
            .entry(ip)
            .or_insert_with(|| MessageWindow::new(self.max_upgrades, self.window))
            .admit_at(now)
    }
}

pub fn ws_origin_allowed(config: &GatewayConfig, origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return config.allow_missing_origin;
    };
    config.cors_allow_any || config.allowed_origins.contains(&normalize_origin(origin))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitRejection {
    PerIp,
    Global,
}

/// Global and per-IP caps on live WebSocket connections.
pub struct ConnectionLimits {
    max_total: usize,
    max_per_ip: usize,
    active: AtomicUsize,
    per_ip: Mutex<HashMap<IpAddr, usize>>,
}

impl ConnectionLimits {
    pub fn new(max_total: usize, max_per_ip: usize) -> Self {
        Self {
            max_total,
            max_per_ip,
            active: AtomicUsize::new(0),
            per_ip: Mutex::new(HashMap::new()),
        }
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Reserve a slot; released when the returned permit drops.
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Result<ConnectionPermit, LimitRejection> {
        let mut counts = match self.per_ip.lock() {
            Ok(v) => v,
            Err(_) => return Err(LimitRejection::Global),
        };
        let count = counts.get(&ip).copied().unwrap_or(0);
        if count >= self.max_per_ip {
            return Err(LimitRejection::PerIp);
        }
        if self.active.load(Ordering::Relaxed) >= self.max_total {
            return Err(LimitRejection::Global);
        }
        counts.insert(ip, count + 1);
        self.active.fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionPermit {
            limits: Arc::clone(self),
            ip,
        })
    }

    fn release(&self, ip: IpAddr) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if let Ok(mut counts) = self.per_ip.lock() {
            if let Some(count) = counts.get_mut(&ip) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.remove(&ip);
                }
            }
        }
    }
}

pub struct ConnectionPermit {
    limits: Arc<ConnectionLimits>,
    ip: IpAddr,
}

impl Drop for ConnectionPermit {
    fn drop(&mut self) {
        self.limits.release(self.ip);
    }
}
