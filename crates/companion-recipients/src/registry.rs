use std::sync::{Arc, Mutex};

use chrono::{DateTime, FixedOffset, Utc};
use companion_core::{Clock, KvStore, Period, RecipientId};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::due::is_due;
use crate::error::{RegistryError, Result};
use crate::types::{LastSent, PeriodFlags, RecipientConfig, RecipientPatch, RecipientStats};

/// Store key of the recipient list.
pub const RECIPIENTS_KEY: &str = "companion_emails_config";

/// Owns recipient configuration and per-period delivery bookkeeping.
///
/// Every mutation is a whole-list read-modify-write on one store key. Writes
/// from this instance are serialised by an internal mutex; writers in other
/// processes are last-write-wins.
pub struct RecipientRegistry {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl RecipientRegistry {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            write_lock: Mutex::new(()),
        }
    }

    /// Register a new recipient. Verification is pending until [`Self::verify`].
    #[instrument(skip_all)]
    pub fn add_recipient(
        &self,
        address: &str,
        display_name: &str,
        periods: PeriodFlags,
    ) -> Result<RecipientConfig> {
        let address = normalize_address(address);
        if !is_valid_address(&address) {
            return Err(RegistryError::Validation(format!(
                "invalid address: {address}"
            )));
        }

        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;
        if all.iter().any(|r| r.address == address) {
            return Err(RegistryError::Validation(format!(
                "address already registered: {address}"
            )));
        }

        let recipient = RecipientConfig {
            id: RecipientId::new(),
            address,
            display_name: display_name.trim().to_string(),
            verified: false,
            verification_token: Some(Uuid::new_v4().simple().to_string()),
            enabled: true,
            periods,
            last_sent: LastSent::default(),
            created_at: self.clock.now(),
        };
        all.push(recipient.clone());
        self.save(&all)?;

        info!(recipient_id = %recipient.id, "recipient added");
        Ok(recipient)
    }

    pub fn get(&self, id: &RecipientId) -> Result<Option<RecipientConfig>> {
        Ok(self.load()?.into_iter().find(|r| &r.id == id))
    }

    /// All recipients in registration order.
    pub fn list(&self) -> Result<Vec<RecipientConfig>> {
        self.load()
    }

    /// Merge `patch` into the recipient. A changed address is re-validated.
    pub fn update_recipient(
        &self,
        id: &RecipientId,
        patch: RecipientPatch,
    ) -> Result<RecipientConfig> {
        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;

        let new_address = match patch.address {
            Some(ref raw) => {
                let address = normalize_address(raw);
                if !is_valid_address(&address) {
                    return Err(RegistryError::Validation(format!(
                        "invalid address: {address}"
                    )));
                }
                if all.iter().any(|r| &r.id != id && r.address == address) {
                    return Err(RegistryError::Validation(format!(
                        "address already registered: {address}"
                    )));
                }
                Some(address)
            }
            None => None,
        };

        let recipient = find_mut(&mut all, id)?;
        if let Some(address) = new_address {
            recipient.address = address;
        }
        if let Some(name) = patch.display_name {
            recipient.display_name = name.trim().to_string();
        }
        if let Some(verified) = patch.verified {
            recipient.verified = verified;
            if verified {
                recipient.verification_token = None;
            }
        }
        if let Some(enabled) = patch.enabled {
            recipient.enabled = enabled;
        }
        if let Some(periods) = patch.periods {
            recipient.periods = periods;
        }
        let updated = recipient.clone();
        self.save(&all)?;

        debug!(recipient_id = %id, "recipient updated");
        Ok(updated)
    }

    /// Delete a recipient. Jobs already queued for it are left alone.
    pub fn remove(&self, id: &RecipientId) -> Result<()> {
        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;
        let before = all.len();
        all.retain(|r| &r.id != id);
        if all.len() == before {
            return Err(RegistryError::NotFound { id: id.to_string() });
        }
        self.save(&all)?;
        info!(recipient_id = %id, "recipient removed");
        Ok(())
    }

    /// Flip the master switch. Returns the new `enabled` value.
    pub fn toggle_enabled(&self, id: &RecipientId) -> Result<bool> {
        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;
        let recipient = find_mut(&mut all, id)?;
        recipient.enabled = !recipient.enabled;
        let enabled = recipient.enabled;
        self.save(&all)?;
        info!(recipient_id = %id, enabled, "recipient toggled");
        Ok(enabled)
    }

    /// Confirm ownership of the address with the token issued at registration.
    pub fn verify(&self, id: &RecipientId, token: &str) -> Result<RecipientConfig> {
        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;
        let recipient = find_mut(&mut all, id)?;
        if recipient.verified {
            return Ok(recipient.clone());
        }
        if recipient.verification_token.as_deref() != Some(token.trim()) {
            warn!(recipient_id = %id, "verification token mismatch");
            return Err(RegistryError::Validation("invalid verification token".into()));
        }
        recipient.verified = true;
        recipient.verification_token = None;
        let verified = recipient.clone();
        self.save(&all)?;
        info!(recipient_id = %id, "recipient verified");
        Ok(verified)
    }

    /// Record a confirmed delivery. The only mutator of `last_sent`.
    pub fn record_sent(&self, id: &RecipientId, period: Period, when: DateTime<Utc>) -> Result<()> {
        let _w = self.write_lock.lock().unwrap();
        let mut all = self.load()?;
        let recipient = find_mut(&mut all, id)?;
        recipient.last_sent.set(period, when);
        self.save(&all)?;
        debug!(recipient_id = %id, %period, %when, "delivery recorded");
        Ok(())
    }

    /// Recipients eligible for `period` whose due rule holds at `now`.
    pub fn due_for_period(
        &self,
        period: Period,
        now: DateTime<FixedOffset>,
    ) -> Result<Vec<RecipientConfig>> {
        let due: Vec<_> = self
            .load()?
            .into_iter()
            .filter(|r| r.is_eligible(period) && is_due(period, r.last_sent.get(period), now))
            .collect();
        debug!(%period, count = due.len(), "due recipients resolved");
        Ok(due)
    }

    pub fn stats(&self) -> Result<RecipientStats> {
        let all = self.load()?;
        let count = |p: Period| all.iter().filter(|r| r.is_eligible(p)).count();
        let latest = |p: Period| all.iter().filter_map(|r| r.last_sent.get(p)).max();
        Ok(RecipientStats {
            total: all.len(),
            verified: all.iter().filter(|r| r.verified).count(),
            enabled: all.iter().filter(|r| r.enabled).count(),
            eligible: all
                .iter()
                .filter(|r| r.enabled && r.verified && r.periods.any())
                .count(),
            daily: count(Period::Daily),
            weekly: count(Period::Weekly),
            monthly: count(Period::Monthly),
            last_daily_sent: latest(Period::Daily),
            last_weekly_sent: latest(Period::Weekly),
            last_monthly_sent: latest(Period::Monthly),
        })
    }

    fn load(&self) -> Result<Vec<RecipientConfig>> {
        Ok(self
            .store
            .get_json::<Vec<RecipientConfig>>(RECIPIENTS_KEY)?
            .unwrap_or_default())
    }

    fn save(&self, all: &[RecipientConfig]) -> Result<()> {
        self.store.set_json(RECIPIENTS_KEY, &all)?;
        Ok(())
    }
}

fn find_mut<'a>(all: &'a mut [RecipientConfig], id: &RecipientId) -> Result<&'a mut RecipientConfig> {
    all.iter_mut()
        .find(|r| &r.id == id)
        .ok_or_else(|| RegistryError::NotFound { id: id.to_string() })
}

fn normalize_address(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// `local@domain.tld` with no whitespace and exactly one `@`.
fn is_valid_address(address: &str) -> bool {
    if address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    // Some dot must have at least one character on each side.
    domain
        .match_indices('.')
        .any(|(i, _)| i > 0 && i + 1 < domain.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use companion_core::{ManualClock, MemoryKvStore};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 5, 0).unwrap()
    }

    fn registry() -> RecipientRegistry {
        RecipientRegistry::new(Arc::new(MemoryKvStore::new()), Arc::new(ManualClock::new(t0())))
    }

    fn daily_only() -> PeriodFlags {
        PeriodFlags {
            daily: true,
            ..Default::default()
        }
    }

    fn add_verified(reg: &RecipientRegistry, address: &str, periods: PeriodFlags) -> RecipientConfig {
        let r = reg.add_recipient(address, "Someone", periods).unwrap();
        reg.update_recipient(
            &r.id,
            RecipientPatch {
                verified: Some(true),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn address_validation() {
        assert!(is_valid_address("ana@example.com"));
        assert!(is_valid_address("a.b+c@mail.example.org"));
        assert!(!is_valid_address("ana@example"));
        assert!(!is_valid_address("ana@.com"));
        assert!(!is_valid_address("ana@example."));
        assert!(!is_valid_address("@example.com"));
        assert!(!is_valid_address("ana@@example.com"));
        assert!(!is_valid_address("an a@example.com"));
    }

    #[test]
    fn add_normalizes_and_rejects_duplicates() {
        let reg = registry();
        let r = reg
            .add_recipient("  Ana@Example.COM ", " Ana ", daily_only())
            .unwrap();
        assert_eq!(r.address, "ana@example.com");
        assert_eq!(r.display_name, "Ana");
        assert!(!r.verified);
        assert!(r.enabled);
        assert_eq!(r.created_at, t0());

        let err = reg
            .add_recipient("ana@example.com", "Again", daily_only())
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        let err = reg.add_recipient("not-an-address", "x", daily_only()).unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));
        assert_eq!(reg.list().unwrap().len(), 1);
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn add_does_not_log_the_address() {
        let logs = LogBuffer::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        let reg = registry();
        let r = tracing::subscriber::with_default(subscriber, || {
            reg.add_recipient("ana@example.com", "Ana Lima", daily_only())
                .unwrap()
        });

        let out = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(out.contains("recipient added"));
        assert!(out.contains(&r.id.to_string()));
        assert!(!out.contains("ana@example.com"));
        assert!(!out.contains("Ana Lima"));
    }

    #[test]
    fn unverified_recipient_is_never_due() {
        let reg = registry();
        reg.add_recipient("ana@example.com", "Ana", daily_only())
            .unwrap();
        assert!(reg
            .due_for_period(Period::Daily, t0().fixed_offset())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn verify_requires_the_issued_token() {
        let reg = registry();
        let r = reg
            .add_recipient("ana@example.com", "Ana", daily_only())
            .unwrap();
        let err = reg.verify(&r.id, "wrong").unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        let token = r.verification_token.clone().unwrap();
        let v = reg.verify(&r.id, &token).unwrap();
        assert!(v.verified);
        assert!(v.verification_token.is_none());
        assert_eq!(
            reg.due_for_period(Period::Daily, t0().fixed_offset())
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn due_honours_enabled_and_period_flags() {
        let reg = registry();
        let a = add_verified(&reg, "a@example.com", daily_only());
        add_verified(&reg, "b@example.com", PeriodFlags::all());
        let now = t0().fixed_offset();

        assert_eq!(reg.due_for_period(Period::Daily, now).unwrap().len(), 2);
        assert_eq!(reg.due_for_period(Period::Weekly, now).unwrap().len(), 1);

        assert!(!reg.toggle_enabled(&a.id).unwrap());
        assert_eq!(reg.due_for_period(Period::Daily, now).unwrap().len(), 1);
        assert!(reg.toggle_enabled(&a.id).unwrap());
    }

    #[test]
    fn record_sent_makes_recipient_not_due_until_next_day() {
        let reg = registry();
        let r = add_verified(&reg, "ana@example.com", daily_only());
        reg.record_sent(&r.id, Period::Daily, t0()).unwrap();

        let later_today = (t0() + Duration::minutes(1)).fixed_offset();
        assert!(reg.due_for_period(Period::Daily, later_today).unwrap().is_empty());

        let tomorrow = (t0() + Duration::days(1)).fixed_offset();
        assert_eq!(reg.due_for_period(Period::Daily, tomorrow).unwrap().len(), 1);

        let stored = reg.get(&r.id).unwrap().unwrap();
        assert_eq!(stored.last_sent.daily, Some(t0()));
        assert!(stored.last_sent.weekly.is_none());
    }

    #[test]
    fn update_rejects_taking_another_recipients_address() {
        let reg = registry();
        let a = add_verified(&reg, "a@example.com", daily_only());
        add_verified(&reg, "b@example.com", daily_only());

        let err = reg
            .update_recipient(
                &a.id,
                RecipientPatch {
                    address: Some("B@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, RegistryError::Validation(_)));

        let renamed = reg
            .update_recipient(
                &a.id,
                RecipientPatch {
                    address: Some("c@example.com".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(renamed.address, "c@example.com");
    }

    #[test]
    fn remove_and_missing_ids() {
        let reg = registry();
        let r = add_verified(&reg, "ana@example.com", daily_only());
        reg.remove(&r.id).unwrap();
        assert!(matches!(
            reg.remove(&r.id).unwrap_err(),
            RegistryError::NotFound { .. }
        ));
        assert!(matches!(
            reg.record_sent(&r.id, Period::Daily, t0()).unwrap_err(),
            RegistryError::NotFound { .. }
        ));
        assert!(reg.get(&r.id).unwrap().is_none());
    }

    #[test]
    fn stats_counts_eligibility_per_period() {
        let reg = registry();
        let a = add_verified(&reg, "a@example.com", daily_only());
        add_verified(
            &reg,
            "b@example.com",
            PeriodFlags {
                weekly: true,
                ..Default::default()
            },
        );
        reg.add_recipient("c@example.com", "Pending", PeriodFlags::all())
            .unwrap();
        reg.record_sent(&a.id, Period::Daily, t0()).unwrap();

        let stats = reg.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.verified, 2);
        assert_eq!(stats.enabled, 3);
        assert_eq!(stats.eligible, 2);
        assert_eq!(stats.daily, 1);
        assert_eq!(stats.weekly, 1);
        assert_eq!(stats.monthly, 0);
        assert_eq!(stats.last_daily_sent, Some(t0()));
        assert!(stats.last_weekly_sent.is_none());
    }
}
