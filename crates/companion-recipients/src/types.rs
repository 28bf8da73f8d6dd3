use chrono::{DateTime, Utc};
use companion_core::{Period, RecipientId};
use serde::{Deserialize, Serialize};

/// Which cadences a recipient subscribes to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodFlags {
    pub daily: bool,
    pub weekly: bool,
    pub monthly: bool,
}

impl PeriodFlags {
    pub fn all() -> Self {
        Self {
            daily: true,
            weekly: true,
            monthly: true,
        }
    }

    pub fn get(&self, period: Period) -> bool {
        match period {
            Period::Daily => self.daily,
            Period::Weekly => self.weekly,
            Period::Monthly => self.monthly,
        }
    }

    pub fn set(&mut self, period: Period, on: bool) {
        match period {
            Period::Daily => self.daily = on,
            Period::Weekly => self.weekly = on,
            Period::Monthly => self.monthly = on,
        }
    }

    pub fn any(&self) -> bool {
        self.daily || self.weekly || self.monthly
    }
}

/// Time of the last confirmed delivery, per period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastSent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<DateTime<Utc>>,
}

impl LastSent {
    pub fn get(&self, period: Period) -> Option<DateTime<Utc>> {
        match period {
            Period::Daily => self.daily,
            Period::Weekly => self.weekly,
            Period::Monthly => self.monthly,
        }
    }

    pub(crate) fn set(&mut self, period: Period, when: DateTime<Utc>) {
        match period {
            Period::Daily => self.daily = Some(when),
            Period::Weekly => self.weekly = Some(when),
            Period::Monthly => self.monthly = Some(when),
        }
    }
}

/// One registered report recipient. Persisted as part of a JSON list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientConfig {
    pub id: RecipientId,
    /// Normalised (trimmed, lower-cased) e-mail address.
    pub address: String,
    pub display_name: String,
    /// Must be true before the recipient can ever be selected as due.
    pub verified: bool,
    /// Pending verification token; cleared once verified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_token: Option<String>,
    /// Master on/off switch.
    pub enabled: bool,
    pub periods: PeriodFlags,
    /// Only mutated through `RecipientRegistry::record_sent`.
    #[serde(default)]
    pub last_sent: LastSent,
    pub created_at: DateTime<Utc>,
}

impl RecipientConfig {
    /// `enabled && verified && periods[period]`.
    pub fn is_eligible(&self, period: Period) -> bool {
        self.enabled && self.verified && self.periods.get(period)
    }
}

/// Partial update applied by `RecipientRegistry::update_recipient`.
///
/// `last_sent` is deliberately absent: only a confirmed delivery moves it.
#[derive(Debug, Clone, Default)]
pub struct RecipientPatch {
    pub address: Option<String>,
    pub display_name: Option<String>,
    pub verified: Option<bool>,
    pub enabled: Option<bool>,
    pub periods: Option<PeriodFlags>,
}

/// Aggregate view for the configuration surface.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipientStats {
    pub total: usize,
    pub verified: usize,
    pub enabled: usize,
    /// Enabled, verified and subscribed to at least one period.
    pub eligible: usize,
    pub daily: usize,
    pub weekly: usize,
    pub monthly: usize,
    pub last_daily_sent: Option<DateTime<Utc>>,
    pub last_weekly_sent: Option<DateTime<Utc>>,
    pub last_monthly_sent: Option<DateTime<Utc>>,
}
