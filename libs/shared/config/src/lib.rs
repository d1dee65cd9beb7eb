use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub supabase_jwt_secret: String,
    pub api_port: u16,
    pub scheduling: SchedulingConfig,
}

/// Clinic-wide scheduling knobs shared by every appointment operation.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulingConfig {
    /// Width of one bookable slot. Appointments start on slot boundaries.
    pub slot_duration_minutes: u32,
    /// Hours before an appointment during which the owning patient may no
    /// longer cancel or reschedule it.
    pub protected_window_hours: u32,
    pub storage_timeout_ms: u64,
    pub notification_webhook_url: Option<String>,
    pub notification_timeout_ms: u64,
}

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            slot_duration_minutes: 30,
            protected_window_hours: 24,
            storage_timeout_ms: 5_000,
            notification_webhook_url: None,
            notification_timeout_ms: 2_000,
        }
    }
}

impl SchedulingConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let slot_duration_minutes = match env_parsed("SLOT_DURATION_MINUTES", defaults.slot_duration_minutes) {
            0 => {
                warn!("SLOT_DURATION_MINUTES must be positive, using default");
                defaults.slot_duration_minutes
            }
            minutes => minutes,
        };

        Self {
            slot_duration_minutes,
            protected_window_hours: env_parsed("PROTECTED_WINDOW_HOURS", defaults.protected_window_hours),
            storage_timeout_ms: env_parsed("STORAGE_TIMEOUT_MS", defaults.storage_timeout_ms),
            notification_webhook_url: env::var("NOTIFICATION_WEBHOOK_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            notification_timeout_ms: env_parsed("NOTIFICATION_TIMEOUT_MS", defaults.notification_timeout_ms),
        }
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, using empty value");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            supabase_jwt_secret: env::var("SUPABASE_JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_JWT_SECRET not set, using empty value");
                    String::new()
                }),
            api_port: env_parsed("API_PORT", 3000),
            scheduling: SchedulingConfig::from_env(),
        };

        if !config.is_configured() {
            warn!("Application not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.supabase_url.is_empty()
            && !self.supabase_anon_key.is_empty()
            && !self.supabase_jwt_secret.is_empty()
    }
}

fn env_parsed<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has an unparsable value '{}', using default", key, raw);
            default
        }),
        Err(_) => default,
    }
}
