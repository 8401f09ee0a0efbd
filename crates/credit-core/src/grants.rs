//! Daily subscription grant types.
//!
//! A daily grant is keyed by `(user_id, subscription_id, grant_date)` where
//! `grant_date` is the start of a calendar day. At most one grant exists per
//! key, which is what makes the scheduler idempotent.

use chrono::{DateTime, FixedOffset, NaiveTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::{PlanId, SubscriptionId, UserId};

/// Start of the calendar day containing `now`, as seen from `offset`.
#[must_use]
pub fn day_start(now: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
    let local_date = now.with_timezone(&offset).date_naive();
    let midnight = local_date.and_time(NaiveTime::MIN);
    offset
        .from_local_datetime(&midnight)
        .single()
        .map_or(now, |local| local.with_timezone(&Utc))
}

/// The uniqueness key of a daily grant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GrantKey {
    /// Granted user.
    pub user_id: UserId,
    /// Subscription the grant belongs to.
    pub subscription_id: SubscriptionId,
    /// Start of the granted day.
    pub grant_date: DateTime<Utc>,
}

/// One daily credit allotment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyGrant {
    /// Unique grant ID.
    pub id: uuid::Uuid,

    /// Granted user.
    pub user_id: UserId,

    /// Subscription the grant belongs to.
    pub subscription_id: SubscriptionId,

    /// Plan of the subscription at grant time.
    pub plan_id: PlanId,

    /// Start of the granted day.
    pub grant_date: DateTime<Utc>,

    /// Credits granted.
    pub credits_granted: Decimal,

    /// When the grant was recorded.
    pub created_at: DateTime<Utc>,
}

impl DailyGrant {
    /// Create a grant record for the day starting at `grant_date`.
    #[must_use]
    pub fn new(
        user_id: UserId,
        subscription_id: SubscriptionId,
        plan_id: PlanId,
        grant_date: DateTime<Utc>,
        credits_granted: Decimal,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            user_id,
            subscription_id,
            plan_id,
            grant_date,
            credits_granted,
            created_at: Utc::now(),
        }
    }

    /// The uniqueness key of this grant.
    #[must_use]
    pub fn key(&self) -> GrantKey {
        GrantKey {
            user_id: self.user_id,
            subscription_id: self.subscription_id.clone(),
            grant_date: self.grant_date,
        }
    }
}

/// An active paid subscription as reported by the subscription registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSubscription {
    /// Subscription ID.
    pub subscription_id: SubscriptionId,

    /// Subscribed user.
    pub user_id: UserId,

    /// Plan of the subscription.
    pub plan_id: PlanId,

    /// Credits granted per calendar day.
    pub daily_credits: Decimal,

    /// When the subscription ends.
    pub expires_at: DateTime<Utc>,
}

impl ActiveSubscription {
    /// Check if the subscription entitles a grant at `now`.
    #[must_use]
    pub fn is_grantable_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now && self.daily_credits > Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    #[test]
    fn day_start_in_utc() {
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 17, 45, 12).unwrap();
        let utc = FixedOffset::east_opt(0).unwrap();
        assert_eq!(
            day_start(now, utc),
            Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn day_start_respects_offset() {
        // 17:45 UTC is 01:45 the next day at UTC+8.
        let now = Utc.with_ymd_and_hms(2024, 5, 10, 17, 45, 12).unwrap();
        let shanghai = FixedOffset::east_opt(8 * 3600).unwrap();
        assert_eq!(
            day_start(now, shanghai),
            Utc.with_ymd_and_hms(2024, 5, 10, 16, 0, 0).unwrap()
        );
    }

    #[test]
    fn same_day_shares_key() {
        let utc = FixedOffset::east_opt(0).unwrap();
        let morning = Utc.with_ymd_and_hms(2024, 5, 10, 1, 0, 0).unwrap();
        let evening = morning + Duration::hours(20);
        assert_eq!(day_start(morning, utc), day_start(evening, utc));
        assert_ne!(day_start(morning, utc), day_start(evening + Duration::hours(4), utc));
    }

    #[test]
    fn grantable_requires_credits_and_future_expiry() {
        let now = Utc::now();
        let mut sub = ActiveSubscription {
            subscription_id: SubscriptionId::new("sub_1").unwrap(),
            user_id: UserId::generate(),
            plan_id: PlanId::new("pro").unwrap(),
            daily_credits: dec!(30),
            expires_at: now + Duration::days(3),
        };
        assert!(sub.is_grantable_at(now));

        sub.expires_at = now - Duration::seconds(1);
        assert!(!sub.is_grantable_at(now));

        sub.expires_at = now + Duration::days(3);
        sub.daily_credits = Decimal::ZERO;
        assert!(!sub.is_grantable_at(now));
    }
}
