//! Order and subscription tracking for one connection.
//!
//! Subscriptions are tracked per channel with at most one record each;
//! orders are registered against the session that created them and keep that
//! association for their whole life, even across session transitions (audit
//! trail). The registry also owns the resubscribe-after-auth bookkeeping used
//! by the reconnection and token-exchange flows.

use ahash::{AHashMap, AHashSet};
use serde_json::Value;
use ustr::Ustr;

use crate::common::{
    consts::{
        DEFAULT_RESUBSCRIBE_MAX_RETRIES, METHOD_SUBSCRIBE_PRIVATE, METHOD_SUBSCRIBE_PUBLIC,
        METHOD_UNSUBSCRIBE_PRIVATE, METHOD_UNSUBSCRIBE_PUBLIC,
    },
    enums::{DeribitOrderDirection, DeribitSubscriptionStatus},
};

/// A channel is private when it carries `.raw`, a `user.` prefix, or the
/// word `private`; private channels require an access token to subscribe.
#[must_use]
pub fn is_private_channel(channel: &str) -> bool {
    channel.contains(".raw") || channel.starts_with("user.") || channel.contains("private")
}

/// Selects the subscribe method for a single channel.
#[must_use]
pub fn subscribe_method(channel: &str) -> &'static str {
    if is_private_channel(channel) {
        METHOD_SUBSCRIBE_PRIVATE
    } else {
        METHOD_SUBSCRIBE_PUBLIC
    }
}

/// Selects the unsubscribe method for a batch.
///
/// One private channel makes the whole batch private so the access token is
/// attached once.
#[must_use]
pub fn unsubscribe_method(channels: &[Ustr]) -> &'static str {
    if channels.iter().any(|c| is_private_channel(c.as_str())) {
        METHOD_UNSUBSCRIBE_PRIVATE
    } else {
        METHOD_UNSUBSCRIBE_PUBLIC
    }
}

/// A tracked channel subscription.
#[derive(Clone, Debug, PartialEq)]
pub struct SubscriptionRecord {
    pub channel: Ustr,
    pub params: Value,
    pub session_id: Option<u64>,
    pub status: DeribitSubscriptionStatus,
}

/// A tracked order, immutable in its session association.
#[derive(Clone, Debug, PartialEq)]
pub struct OrderRecord {
    pub order_id: String,
    pub session_id: u64,
    pub instrument: Ustr,
    pub direction: DeribitOrderDirection,
    pub status: String,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub metadata: Value,
}

/// Outcome of one resubscription pass.
#[derive(Clone, Debug, PartialEq)]
pub enum ResubscribeOutcome {
    /// Every channel confirmed.
    Done,
    /// Some channels failed; another pass is scheduled.
    Retry { attempt: u32, failed: Vec<Ustr> },
    /// Retries exhausted; the listed channels stay failed.
    Exhausted { failed: Vec<Ustr> },
}

/// Order and subscription registry for one connection.
#[derive(Clone, Debug)]
pub struct Registry {
    channels: AHashMap<Ustr, SubscriptionRecord>,
    orders: AHashMap<String, OrderRecord>,
    orders_by_session: AHashMap<u64, AHashSet<String>>,
    active_session_id: Option<u64>,
    resubscribe_after_auth: bool,
    retry_count: u32,
    max_retries: u32,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DEFAULT_RESUBSCRIBE_MAX_RETRIES)
    }
}

impl Registry {
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            channels: AHashMap::new(),
            orders: AHashMap::new(),
            orders_by_session: AHashMap::new(),
            active_session_id: None,
            resubscribe_after_auth: false,
            retry_count: 0,
            max_retries,
        }
    }

    // -- Subscriptions -----------------------------------------------------

    /// Records an outgoing subscribe request for `channel`.
    ///
    /// Re-subscribing an already tracked channel overwrites the stored
    /// params; there is never more than one record per channel.
    pub fn mark_pending(&mut self, channel: Ustr, params: Value) {
        self.channels.insert(
            channel,
            SubscriptionRecord {
                channel,
                params,
                session_id: self.active_session_id,
                status: DeribitSubscriptionStatus::Pending,
            },
        );
    }

    /// Confirms a channel after a successful subscribe response.
    pub fn confirm(&mut self, channel: &Ustr) {
        if let Some(record) = self.channels.get_mut(channel) {
            record.status = DeribitSubscriptionStatus::Active;
            record.session_id = self.active_session_id;
            tracing::debug!(
                target: "deribit_client",
                channel = %channel,
                "subscription.created",
            );
        }
    }

    /// Drops channels after a successful unsubscribe response.
    pub fn remove(&mut self, channels: &[Ustr]) {
        for channel in channels {
            if self.channels.remove(channel).is_some() {
                tracing::debug!(
                    target: "deribit_client",
                    channel = %channel,
                    "subscription.removed",
                );
            }
        }
    }

    /// Clears the whole registry after `public/unsubscribe_all` returns `"ok"`.
    pub fn clear_subscriptions(&mut self) {
        self.channels.clear();
    }

    #[must_use]
    pub fn subscription(&self, channel: &Ustr) -> Option<&SubscriptionRecord> {
        self.channels.get(channel)
    }

    #[must_use]
    pub fn subscriptions(&self) -> impl Iterator<Item = &SubscriptionRecord> {
        self.channels.values()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.channels.len()
    }

    // -- Resubscription pipeline -------------------------------------------

    pub fn set_resubscribe_after_auth(&mut self) {
        self.resubscribe_after_auth = true;
    }

    #[must_use]
    pub fn resubscribe_after_auth(&self) -> bool {
        self.resubscribe_after_auth
    }

    /// Starts a resubscription pass, returning the channels to replay.
    ///
    /// An empty registry intentionally keeps the flag set so channels
    /// registered later still trigger the flow.
    pub fn begin_resubscription(&mut self) -> Vec<(Ustr, Value)> {
        if self.channels.is_empty() {
            return Vec::new();
        }
        self.resubscribe_after_auth = false;

        let mut batch: Vec<(Ustr, Value)> = self
            .channels
            .values_mut()
            .map(|record| {
                record.status = DeribitSubscriptionStatus::Resubscribing;
                (record.channel, record.params.clone())
            })
            .collect();
        batch.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));

        tracing::info!(
            target: "deribit_client",
            channel_count = batch.len(),
            attempt = self.retry_count + 1,
            "resubscription.start",
        );
        batch
    }

    /// Finishes a pass given the channels that failed.
    pub fn complete_resubscription(&mut self, failed: Vec<Ustr>) -> ResubscribeOutcome {
        for record in self.channels.values_mut() {
            if record.status == DeribitSubscriptionStatus::Resubscribing {
                record.status = DeribitSubscriptionStatus::Active;
            }
        }

        if failed.is_empty() {
            self.retry_count = 0;
            tracing::info!(target: "deribit_client", "resubscription.success");
            return ResubscribeOutcome::Done;
        }

        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.resubscribe_after_auth = true;
            for channel in &failed {
                if let Some(record) = self.channels.get_mut(channel) {
                    record.status = DeribitSubscriptionStatus::Resubscribing;
                }
            }
            tracing::warn!(
                target: "deribit_client",
                attempt = self.retry_count,
                failed = ?failed,
                "resubscription.retry",
            );
            return ResubscribeOutcome::Retry {
                attempt: self.retry_count,
                failed,
            };
        }

        self.retry_count = 0;
        self.resubscribe_after_auth = false;
        for channel in &failed {
            if let Some(record) = self.channels.get_mut(channel) {
                record.status = DeribitSubscriptionStatus::Failed;
            }
        }
        tracing::error!(
            target: "deribit_client",
            failed = ?failed,
            "resubscription.failure",
        );
        ResubscribeOutcome::Exhausted { failed }
    }

    // -- Orders ------------------------------------------------------------

    /// Registers an order against the current active session.
    ///
    /// # Errors
    ///
    /// Returns the order id back when no session is active.
    pub fn register_order(
        &mut self,
        order_id: String,
        instrument: Ustr,
        direction: DeribitOrderDirection,
        status: String,
        metadata: Value,
        now_ms: u64,
    ) -> Result<(), String> {
        let Some(session_id) = self.active_session_id else {
            return Err(order_id);
        };

        self.orders_by_session
            .entry(session_id)
            .or_default()
            .insert(order_id.clone());
        tracing::debug!(
            target: "deribit_client",
            order_id = %order_id,
            session_id,
            instrument = %instrument,
            "order_context.order_registered",
        );
        self.orders.insert(
            order_id.clone(),
            OrderRecord {
                order_id,
                session_id,
                instrument,
                direction,
                status,
                created_at_ms: now_ms,
                updated_at_ms: now_ms,
                metadata,
            },
        );
        Ok(())
    }

    /// Updates a tracked order's status and metadata.
    ///
    /// The session association never changes, even when the active session
    /// has since transitioned.
    ///
    /// # Errors
    ///
    /// Returns `Err(order_id)` when the order is unknown.
    pub fn update_order(
        &mut self,
        order_id: &str,
        status: String,
        metadata: Option<Value>,
        now_ms: u64,
    ) -> Result<&OrderRecord, String> {
        let Some(order) = self.orders.get_mut(order_id) else {
            return Err(order_id.to_string());
        };
        order.status = status;
        if let Some(metadata) = metadata {
            order.metadata = metadata;
        }
        order.updated_at_ms = now_ms;
        tracing::debug!(
            target: "deribit_client",
            order_id = %order_id,
            status = %order.status,
            "order_context.order_updated",
        );
        Ok(order)
    }

    #[must_use]
    pub fn order(&self, order_id: &str) -> Option<&OrderRecord> {
        self.orders.get(order_id)
    }

    #[must_use]
    pub fn orders_for_session(&self, session_id: u64) -> Vec<&OrderRecord> {
        self.orders_by_session
            .get(&session_id)
            .map(|ids| ids.iter().filter_map(|id| self.orders.get(id)).collect())
            .unwrap_or_default()
    }

    // -- Session association ----------------------------------------------

    /// Adopts a new active session for future registrations.
    pub fn set_active_session(&mut self, session_id: u64) {
        self.active_session_id = Some(session_id);
    }

    /// Handles a session transition: future registrations attach to the new
    /// session and the subscription set is replayed after the next auth.
    pub fn on_session_transition(&mut self, prev_id: Option<u64>, new_id: u64) {
        self.active_session_id = Some(new_id);
        self.resubscribe_after_auth = true;
        tracing::info!(
            target: "deribit_client",
            prev_id = ?prev_id,
            new_id,
            "order_context.session_transition",
        );
    }

    #[must_use]
    pub fn active_session_id(&self) -> Option<u64> {
        self.active_session_id
    }
}

////////////////////////////////////////////////////////////////////////////////
// Tests
////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn channel(name: &str) -> Ustr {
        Ustr::from(name)
    }

    #[rstest]
    #[case("book.BTC-PERPETUAL.raw", true)]
    #[case("user.orders.BTC-PERPETUAL.raw", true)]
    #[case("user.portfolio.btc", true)]
    #[case("private.trades", true)]
    #[case("ticker.BTC-PERPETUAL.100ms", false)]
    #[case("book.BTC-PERPETUAL.100ms", false)]
    #[case("deribit_price_index.btc_usd", false)]
    fn test_channel_privacy_rule(#[case] name: &str, #[case] private: bool) {
        assert_eq!(is_private_channel(name), private);
    }

    #[rstest]
    fn test_unsubscribe_batch_routing() {
        let public_only = [channel("ticker.BTC-PERPETUAL.100ms")];
        assert_eq!(unsubscribe_method(&public_only), "public/unsubscribe");

        let mixed = [
            channel("ticker.BTC-PERPETUAL.100ms"),
            channel("user.orders.any"),
        ];
        assert_eq!(unsubscribe_method(&mixed), "private/unsubscribe");
    }

    #[rstest]
    fn test_one_record_per_channel() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        let ch = channel("ticker.BTC-PERPETUAL.100ms");
        registry.mark_pending(ch, json!({"interval": "100ms"}));
        registry.mark_pending(ch, json!({"interval": "raw"}));
        assert_eq!(registry.subscription_count(), 1);
        assert_eq!(
            registry.subscription(&ch).unwrap().params,
            json!({"interval": "raw"})
        );
    }

    #[rstest]
    fn test_confirm_and_remove() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        let ch = channel("ticker.ETH-PERPETUAL.100ms");
        registry.mark_pending(ch, json!({}));
        assert_eq!(
            registry.subscription(&ch).unwrap().status,
            DeribitSubscriptionStatus::Pending
        );

        registry.confirm(&ch);
        assert_eq!(
            registry.subscription(&ch).unwrap().status,
            DeribitSubscriptionStatus::Active
        );

        registry.remove(&[ch]);
        assert!(registry.subscription(&ch).is_none());
    }

    #[rstest]
    fn test_resubscription_replays_stored_params() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        registry.mark_pending(channel("a.one"), json!({"depth": 10}));
        registry.mark_pending(channel("b.two"), json!({}));
        registry.set_resubscribe_after_auth();

        let batch = registry.begin_resubscription();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].0.as_str(), "a.one");
        assert_eq!(batch[0].1, json!({"depth": 10}));
        assert!(!registry.resubscribe_after_auth());

        let outcome = registry.complete_resubscription(Vec::new());
        assert_eq!(outcome, ResubscribeOutcome::Done);
        assert!(
            registry
                .subscriptions()
                .all(|s| s.status == DeribitSubscriptionStatus::Active)
        );
    }

    #[rstest]
    fn test_empty_registry_preserves_resubscribe_flag() {
        let mut registry = Registry::default();
        registry.set_resubscribe_after_auth();
        let batch = registry.begin_resubscription();
        assert!(batch.is_empty());
        // Late registrations must still trigger the flow.
        assert!(registry.resubscribe_after_auth());
    }

    #[rstest]
    fn test_resubscription_retry_then_exhaustion() {
        let mut registry = Registry::new(2);
        registry.set_active_session(1);
        let bad = channel("user.orders.bad");
        registry.mark_pending(bad, json!({}));
        registry.set_resubscribe_after_auth();

        for attempt in 1..=2u32 {
            registry.begin_resubscription();
            match registry.complete_resubscription(vec![bad]) {
                ResubscribeOutcome::Retry { attempt: a, .. } => assert_eq!(a, attempt),
                other => panic!("expected retry, got {other:?}"),
            }
            assert!(registry.resubscribe_after_auth());
        }

        registry.begin_resubscription();
        match registry.complete_resubscription(vec![bad]) {
            ResubscribeOutcome::Exhausted { failed } => assert_eq!(failed, vec![bad]),
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert!(!registry.resubscribe_after_auth());
        assert_eq!(
            registry.subscription(&bad).unwrap().status,
            DeribitSubscriptionStatus::Failed
        );
    }

    #[rstest]
    fn test_partial_failure_keeps_successes_active() {
        let mut registry = Registry::new(0);
        registry.set_active_session(1);
        let good = channel("ticker.BTC-PERPETUAL.100ms");
        let bad = channel("user.orders.bad");
        registry.mark_pending(good, json!({}));
        registry.mark_pending(bad, json!({}));

        registry.begin_resubscription();
        let outcome = registry.complete_resubscription(vec![bad]);
        assert!(matches!(outcome, ResubscribeOutcome::Exhausted { .. }));
        assert_eq!(
            registry.subscription(&good).unwrap().status,
            DeribitSubscriptionStatus::Active
        );
        assert_eq!(
            registry.subscription(&bad).unwrap().status,
            DeribitSubscriptionStatus::Failed
        );
    }

    #[rstest]
    fn test_orders_keep_session_association_across_transitions() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        registry
            .register_order(
                "ord-1".to_string(),
                Ustr::from("BTC-PERPETUAL"),
                DeribitOrderDirection::Buy,
                "open".to_string(),
                json!({}),
                100,
            )
            .unwrap();

        registry.on_session_transition(Some(1), 2);
        registry
            .register_order(
                "ord-2".to_string(),
                Ustr::from("ETH-PERPETUAL"),
                DeribitOrderDirection::Sell,
                "open".to_string(),
                json!({}),
                200,
            )
            .unwrap();

        // The first order stays attached to session 1.
        assert_eq!(registry.order("ord-1").unwrap().session_id, 1);
        assert_eq!(registry.order("ord-2").unwrap().session_id, 2);
        assert_eq!(registry.orders_for_session(1).len(), 1);
        assert_eq!(registry.orders_for_session(2).len(), 1);

        // Updating after the transition does not migrate it either.
        registry
            .update_order("ord-1", "filled".to_string(), None, 300)
            .unwrap();
        assert_eq!(registry.order("ord-1").unwrap().session_id, 1);
        assert_eq!(registry.order("ord-1").unwrap().updated_at_ms, 300);
    }

    #[rstest]
    fn test_update_unknown_order_not_found() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        assert!(
            registry
                .update_order("missing", "x".to_string(), None, 1)
                .is_err()
        );
    }

    #[rstest]
    fn test_session_transition_sets_resubscribe_flag() {
        let mut registry = Registry::default();
        registry.set_active_session(1);
        assert!(!registry.resubscribe_after_auth());
        registry.on_session_transition(Some(1), 2);
        assert!(registry.resubscribe_after_auth());
        assert_eq!(registry.active_session_id(), Some(2));
    }
}
