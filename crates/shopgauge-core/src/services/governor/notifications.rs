//! Notification system
//!
//! Capped, most-recent-first store of operator-facing events with topic
//! subscriptions. Oldest entries are evicted first, read or not.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use super::persistence::{PersistSlot, Persistence};
use super::types::{
    Notification, NotificationKind, NotificationTopic, Plan, PlanRateLimits, ThrottleStatus,
};

/// Default notification capacity
pub const DEFAULT_MAX_NOTIFICATIONS: usize = 100;

/// Listener for new notifications
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Handle returned by [`NotificationSystem::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Which notifications a subscriber receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    All,
    Topic(NotificationTopic),
}

impl TopicFilter {
    fn matches(&self, topic: &NotificationTopic) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Topic(wanted) => wanted == topic,
        }
    }
}

impl From<NotificationTopic> for TopicFilter {
    fn from(topic: NotificationTopic) -> Self {
        TopicFilter::Topic(topic)
    }
}

/// Construction options for [`NotificationSystem`]
#[derive(Clone)]
pub struct NotificationOptions {
    pub max_notifications: usize,
    pub storage_key: String,
    /// Sees every new notification
    pub on_new_notification: Option<NotificationCallback>,
}

impl Default for NotificationOptions {
    fn default() -> Self {
        Self {
            max_notifications: DEFAULT_MAX_NOTIFICATIONS,
            storage_key: "shopgauge.notifications".to_string(),
            on_new_notification: None,
        }
    }
}

struct Subscriber {
    id: SubscriptionId,
    filter: TopicFilter,
    callback: NotificationCallback,
}

/// Topic-based store for operator-facing events
pub struct NotificationSystem {
    notifications: RwLock<VecDeque<Notification>>,
    subscribers: RwLock<Vec<Subscriber>>,
    next_subscription: AtomicU64,
    max_notifications: usize,
    on_new_notification: Option<NotificationCallback>,
    slot: PersistSlot,
}

impl NotificationSystem {
    /// Create an in-memory store
    pub fn new(options: NotificationOptions) -> Self {
        Self::with_state(options, VecDeque::new(), PersistSlot::disabled(String::new()))
    }

    /// Create a store restored from `persistence`
    pub async fn load(
        options: NotificationOptions,
        persistence: Option<Arc<dyn Persistence>>,
    ) -> Self {
        let slot = PersistSlot::new(persistence, options.storage_key.clone());
        let restored = slot
            .load::<VecDeque<Notification>>()
            .await
            .unwrap_or_default();
        log::info!(
            "[governor:notifications] Restored {} notifications",
            restored.len()
        );
        Self::with_state(options, restored, slot)
    }

    fn with_state(
        options: NotificationOptions,
        mut notifications: VecDeque<Notification>,
        slot: PersistSlot,
    ) -> Self {
        let max_notifications = options.max_notifications.max(1);
        notifications.truncate(max_notifications);
        Self {
            notifications: RwLock::new(notifications),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            max_notifications,
            on_new_notification: options.on_new_notification,
            slot,
        }
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Publish a notification
    pub async fn notify(
        &self,
        message: impl Into<String>,
        kind: NotificationKind,
        topic: impl Into<NotificationTopic>,
    ) -> Notification {
        let notification = Notification::new(message, kind, topic.into());

        let pending = {
            let mut list = self.notifications.write().await;
            list.push_front(notification.clone());
            list.truncate(self.max_notifications);
            self.slot.prepare(&*list)
        };
        self.slot.commit(pending).await;

        log::debug!(
            "[governor:notifications] [{}/{}] {}",
            notification.kind,
            notification.topic,
            notification.message
        );

        self.dispatch(&notification).await;
        notification
    }

    async fn dispatch(&self, notification: &Notification) {
        if let Some(callback) = &self.on_new_notification {
            callback(notification);
        }

        let listeners: Vec<NotificationCallback> = self
            .subscribers
            .read()
            .await
            .iter()
            .filter(|s| s.filter.matches(&notification.topic))
            .map(|s| Arc::clone(&s.callback))
            .collect();

        for listener in listeners {
            listener(notification);
        }
    }

    /// Warn that the bucket is filling up
    pub async fn notify_rate_limit_approaching(
        &self,
        status: &ThrottleStatus,
        percentage_used: f64,
    ) -> Notification {
        self.notify(
            format!(
                "API rate limit at {:.1}% ({:.0} of {:.0} points available)",
                percentage_used, status.currently_available, status.maximum_available
            ),
            NotificationKind::Warning,
            NotificationTopic::RateLimit,
        )
        .await
    }

    /// Report a throttled request
    pub async fn notify_rate_limit_exceeded(&self, status: &ThrottleStatus) -> Notification {
        let message = match status.time_until_available(1.0) {
            Some(wait) if !wait.is_zero() => format!(
                "API rate limit exceeded ({:.0} of {:.0} points available, retry in {:.1}s)",
                status.currently_available,
                status.maximum_available,
                wait.as_secs_f64()
            ),
            _ => format!(
                "API rate limit exceeded ({:.0} of {:.0} points available)",
                status.currently_available, status.maximum_available
            ),
        };
        self.notify(message, NotificationKind::Error, NotificationTopic::RateLimit)
            .await
    }

    /// Report a transport or protocol failure
    pub async fn notify_api_error(
        &self,
        error: &(dyn std::error::Error + Send + Sync),
    ) -> Notification {
        self.notify(
            format!("API request failed: {}", error),
            NotificationKind::Error,
            NotificationTopic::ApiError,
        )
        .await
    }

    /// Announce a plan switch
    pub async fn notify_plan_changed(&self, plan: Plan, limits: &PlanRateLimits) -> Notification {
        self.notify(
            format!(
                "Plan changed to {} ({} points/s, max query cost {})",
                plan, limits.points_per_second, limits.max_single_query_cost
            ),
            NotificationKind::Info,
            NotificationTopic::PlanChange,
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Register `callback` for notifications matching `filter`
    pub async fn subscribe(
        &self,
        filter: impl Into<TopicFilter>,
        callback: NotificationCallback,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscribers.write().await.push(Subscriber {
            id,
            filter: filter.into(),
            callback,
        });
        id
    }

    /// Remove a subscription; `false` when it was not registered
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().await;
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        subscribers.len() != before
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// Unread notifications, newest first
    pub async fn get_unread(&self) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| !n.read)
            .cloned()
            .collect()
    }

    /// Every notification, newest first
    pub async fn get_all(&self) -> Vec<Notification> {
        self.notifications.read().await.iter().cloned().collect()
    }

    /// Notifications under `topic`, newest first
    pub async fn get_by_topic(&self, topic: &NotificationTopic) -> Vec<Notification> {
        self.notifications
            .read()
            .await
            .iter()
            .filter(|n| &n.topic == topic)
            .cloned()
            .collect()
    }

    pub async fn unread_count(&self) -> usize {
        self.notifications.read().await.iter().filter(|n| !n.read).count()
    }

    // ------------------------------------------------------------------------
    // State changes
    // ------------------------------------------------------------------------

    /// Mark one notification as read; `false` if the id is unknown
    pub async fn mark_as_read(&self, id: &str) -> bool {
        let pending = {
            let mut list = self.notifications.write().await;
            match list.iter_mut().find(|n| n.id == id) {
                Some(notification) if !notification.read => {
                    notification.read = true;
                    self.slot.prepare(&*list)
                }
                Some(_) => return true,
                None => return false,
            }
        };
        self.slot.commit(pending).await;
        true
    }

    /// Mark everything as read, returning how many flipped
    pub async fn mark_all_as_read(&self) -> usize {
        let (flipped, pending) = {
            let mut list = self.notifications.write().await;
            let mut flipped = 0;
            for notification in list.iter_mut().filter(|n| !n.read) {
                notification.read = true;
                flipped += 1;
            }
            if flipped == 0 {
                return 0;
            }
            (flipped, self.slot.prepare(&*list))
        };
        self.slot.commit(pending).await;
        flipped
    }

    /// Remove every notification
    pub async fn clear(&self) {
        let pending = {
            let mut list = self.notifications.write().await;
            list.clear();
            self.slot.prepare(&*list)
        };
        self.slot.commit(pending).await;
        log::info!("[governor:notifications] Cleared notifications");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::governor::persistence::tests::FailingPersistence;
    use crate::services::governor::persistence::MemoryPersistence;
    use std::sync::Mutex;

    fn system(max: usize) -> NotificationSystem {
        NotificationSystem::new(NotificationOptions {
            max_notifications: max,
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_notify_prepends_and_caps() {
        let notifications = system(3);
        for i in 0..5 {
            notifications
                .notify(format!("n{}", i), NotificationKind::Info, NotificationTopic::System)
                .await;
        }

        let all = notifications.get_all().await;
        let messages: Vec<_> = all.iter().map(|n| n.message.as_str()).collect();
        assert_eq!(messages, vec!["n4", "n3", "n2"]);
    }

    #[tokio::test]
    async fn test_eviction_ignores_read_state() {
        let notifications = system(2);
        let first = notifications
            .notify("first", NotificationKind::Info, NotificationTopic::System)
            .await;
        notifications
            .notify("second", NotificationKind::Info, NotificationTopic::System)
            .await;
        notifications.mark_as_read(&first.id).await;
        notifications
            .notify("third", NotificationKind::Info, NotificationTopic::System)
            .await;

        let all = notifications.get_all().await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|n| n.message != "first"));
    }

    #[tokio::test]
    async fn test_mark_as_read() {
        let notifications = system(10);
        let a = notifications
            .notify("a", NotificationKind::Warning, NotificationTopic::RateLimit)
            .await;
        notifications
            .notify("b", NotificationKind::Warning, NotificationTopic::RateLimit)
            .await;
        assert_eq!(notifications.unread_count().await, 2);

        assert!(notifications.mark_as_read(&a.id).await);
        assert!(!notifications.mark_as_read("missing").await);
        assert_eq!(notifications.unread_count().await, 1);

        assert_eq!(notifications.mark_all_as_read().await, 1);
        assert_eq!(notifications.mark_all_as_read().await, 0);
        assert!(notifications.get_unread().await.is_empty());
    }

    #[tokio::test]
    async fn test_typed_helpers_use_expected_kind_and_topic() {
        let notifications = system(10);
        let status = ThrottleStatus::new(100.0, 15.0, 50.0);

        let approaching = notifications.notify_rate_limit_approaching(&status, 85.0).await;
        assert_eq!(approaching.kind, NotificationKind::Warning);
        assert_eq!(approaching.topic, NotificationTopic::RateLimit);
        assert!(approaching.message.contains("85.0%"));

        let exceeded = notifications.notify_rate_limit_exceeded(&status).await;
        assert_eq!(exceeded.kind, NotificationKind::Error);
        assert_eq!(exceeded.topic, NotificationTopic::RateLimit);

        let err = std::io::Error::new(std::io::ErrorKind::Other, "connection reset");
        let api_error = notifications.notify_api_error(&err).await;
        assert_eq!(api_error.topic, NotificationTopic::ApiError);
        assert!(api_error.message.contains("connection reset"));

        let plan = notifications
            .notify_plan_changed(Plan::Plus, &Plan::Plus.rate_limits())
            .await;
        assert_eq!(plan.kind, NotificationKind::Info);
        assert_eq!(plan.topic, NotificationTopic::PlanChange);
        assert!(plan.message.contains("plus"));
    }

    #[tokio::test]
    async fn test_get_by_topic() {
        let notifications = system(10);
        notifications
            .notify("a", NotificationKind::Info, NotificationTopic::System)
            .await;
        notifications
            .notify("b", NotificationKind::Info, "inventory")
            .await;

        let custom = notifications
            .get_by_topic(&NotificationTopic::Other("inventory".to_string()))
            .await;
        assert_eq!(custom.len(), 1);
        assert_eq!(custom[0].message, "b");
    }

    #[tokio::test]
    async fn test_subscribers_receive_matching_topics() {
        let notifications = system(10);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let everything = Arc::new(Mutex::new(0usize));

        let seen_clone = Arc::clone(&seen);
        let id = notifications
            .subscribe(
                NotificationTopic::Mutation,
                Arc::new(move |n: &Notification| {
                    seen_clone.lock().unwrap().push(n.message.clone());
                }),
            )
            .await;

        let everything_clone = Arc::clone(&everything);
        notifications
            .subscribe(
                TopicFilter::All,
                Arc::new(move |_: &Notification| {
                    *everything_clone.lock().unwrap() += 1;
                }),
            )
            .await;

        notifications
            .notify("m1", NotificationKind::Error, NotificationTopic::Mutation)
            .await;
        notifications
            .notify("s1", NotificationKind::Info, NotificationTopic::System)
            .await;

        assert!(notifications.unsubscribe(id).await);
        assert!(!notifications.unsubscribe(id).await);
        notifications
            .notify("m2", NotificationKind::Error, NotificationTopic::Mutation)
            .await;

        assert_eq!(*seen.lock().unwrap(), vec!["m1".to_string()]);
        assert_eq!(*everything.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_callback_can_reenter_store() {
        // Listeners run after the list lock is released
        let notifications = Arc::new(system(10));
        let observed = Arc::new(Mutex::new(None));

        let observed_clone = Arc::clone(&observed);
        let store = Arc::clone(&notifications);
        notifications
            .subscribe(
                TopicFilter::All,
                Arc::new(move |_: &Notification| {
                    let count = store.notifications.try_read().map(|list| list.len()).ok();
                    *observed_clone.lock().unwrap() = count;
                }),
            )
            .await;

        notifications
            .notify("x", NotificationKind::Info, NotificationTopic::System)
            .await;
        assert_eq!(*observed.lock().unwrap(), Some(1));
    }

    #[tokio::test]
    async fn test_on_new_notification_callback() {
        let count = Arc::new(Mutex::new(0usize));
        let count_clone = Arc::clone(&count);
        let notifications = NotificationSystem::new(NotificationOptions {
            on_new_notification: Some(Arc::new(move |_: &Notification| {
                *count_clone.lock().unwrap() += 1;
            })),
            ..Default::default()
        });

        notifications
            .notify("a", NotificationKind::Success, NotificationTopic::System)
            .await;
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_persists_and_restores() {
        let backend = Arc::new(MemoryPersistence::new());
        let options = NotificationOptions {
            storage_key: "gauge.notifications".to_string(),
            ..Default::default()
        };

        let notifications = NotificationSystem::load(options.clone(), Some(backend.clone())).await;
        let n = notifications
            .notify("saved", NotificationKind::Info, NotificationTopic::System)
            .await;
        notifications.mark_as_read(&n.id).await;

        let restored = NotificationSystem::load(options, Some(backend)).await;
        let all = restored.get_all().await;
        assert_eq!(all.len(), 1);
        assert!(all[0].read);
        assert_eq!(all[0].topic, NotificationTopic::System);
    }

    #[tokio::test]
    async fn test_failing_storage_is_absorbed() {
        let notifications = NotificationSystem::load(
            NotificationOptions::default(),
            Some(Arc::new(FailingPersistence)),
        )
        .await;
        notifications
            .notify("still works", NotificationKind::Info, NotificationTopic::System)
            .await;
        notifications.clear().await;
        assert!(notifications.get_all().await.is_empty());
    }
}
