//! 输入状态跟踪
//!
//! 每个用户最多一个计时器。重新开始输入会先取消旧计时器；计时器到期时合成一次
//! `typing: false`，就像用户自己停止了一样。计时器带代次号，到期时重新校验，
//! 被替换掉的计时器即使已经醒来也不会再广播。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use domain::{UserId, UserProfile};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::clock::Clock;
use crate::events::{ServerEvent, TypingNotice};
use crate::presence::PresenceRegistry;
use crate::rooms::{is_conversation_room, ConversationRooms};

pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_millis(3000);

struct TypingTimer {
    generation: u64,
    receiver: UserId,
    conversation_id: Option<String>,
    expiry: JoinHandle<()>,
}

struct Inner {
    timers: Mutex<HashMap<UserId, TypingTimer>>,
    generation: AtomicU64,
    timeout: Duration,
    presence: Arc<PresenceRegistry>,
    rooms: Arc<ConversationRooms>,
    clock: Arc<dyn Clock>,
}

#[derive(Clone)]
pub struct TypingTracker {
    inner: Arc<Inner>,
}

impl TypingTracker {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        rooms: Arc<ConversationRooms>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                timers: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(0),
                timeout,
                presence,
                rooms,
                clock,
            }),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// 开始输入：替换计时器并通知对方。
    pub async fn start(
        &self,
        user: &UserProfile,
        receiver: UserId,
        conversation_id: Option<String>,
    ) {
        // 持锁期间生成计时器并登记，到期任务一定能看到自己的条目
        {
            let mut timers = self.inner.timers.lock().await;
            let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
            let expiry = {
                let tracker = self.clone();
                let user = user.clone();
                let timeout = self.inner.timeout;
                tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    tracker.expire(&user, generation).await;
                })
            };
            let previous = timers.insert(
                user.id,
                TypingTimer {
                    generation,
                    receiver,
                    conversation_id: conversation_id.clone(),
                    expiry,
                },
            );
            if let Some(previous) = previous {
                previous.expiry.abort();
            }
        }

        self.notify(user, receiver, conversation_id, true).await;
    }

    /// 停止输入：取消计时器（若有）并通知对方。重复调用无副作用。
    pub async fn stop(
        &self,
        user: &UserProfile,
        receiver: UserId,
        conversation_id: Option<String>,
    ) {
        if let Some(timer) = self.inner.timers.lock().await.remove(&user.id) {
            timer.expiry.abort();
        }
        self.notify(user, receiver, conversation_id, false).await;
    }

    /// 断开连接时静默清除。
    pub async fn clear(&self, user: UserId) {
        if let Some(timer) = self.inner.timers.lock().await.remove(&user) {
            timer.expiry.abort();
        }
    }

    pub async fn is_typing(&self, user: UserId) -> bool {
        self.inner.timers.lock().await.contains_key(&user)
    }

    pub async fn active_count(&self) -> usize {
        self.inner.timers.lock().await.len()
    }

    async fn expire(&self, user: &UserProfile, generation: u64) {
        let timer = {
            let mut timers = self.inner.timers.lock().await;
            match timers.get(&user.id) {
                Some(timer) if timer.generation == generation => timers.remove(&user.id),
                _ => None,
            }
        };
        let Some(timer) = timer else {
            return;
        };
        tracing::debug!(user_id = %user.id, "输入状态超时");
        self.notify(user, timer.receiver, timer.conversation_id, false)
            .await;
    }

    async fn notify(
        &self,
        user: &UserProfile,
        receiver: UserId,
        conversation_id: Option<String>,
        typing: bool,
    ) {
        let event = ServerEvent::UserTyping(TypingNotice {
            user_id: user.id,
            username: user.username.clone(),
            zodiac_sign: user.zodiac_sign.clone(),
            typing,
            conversation_id: conversation_id.clone(),
            timestamp: self.inner.clock.now(),
        });

        if let Some(handle) = self.inner.presence.lookup(receiver).await {
            handle.emit(event.clone());
        }
        match conversation_id {
            Some(room) if is_conversation_room(&room, user.id, receiver) => {
                self.inner.rooms.broadcast(&room, &event).await;
            }
            Some(room) => {
                tracing::debug!(user_id = %user.id, room = %room, "会话房间不属于这两个用户，不广播");
            }
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection::{ConnectionHandle, Outbound};
    use crate::rooms::{personal_room, room_keys_for};
    use tokio::sync::mpsc::UnboundedReceiver;
    use uuid::Uuid;

    struct Fixture {
        tracker: TypingTracker,
        rooms: Arc<ConversationRooms>,
        sender: UserProfile,
        receiver: UserProfile,
        receiver_rx: UnboundedReceiver<Outbound>,
    }

    async fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let presence = Arc::new(PresenceRegistry::new(clock.clone()));
        let rooms = Arc::new(ConversationRooms::new());
        let tracker = TypingTracker::new(
            presence.clone(),
            rooms.clone(),
            clock,
            DEFAULT_TYPING_TIMEOUT,
        );

        let sender = UserProfile::new(UserId::from(Uuid::new_v4()), "aries").with_zodiac("Aries");
        let receiver = UserProfile::new(UserId::from(Uuid::new_v4()), "leo").with_zodiac("Leo");
        let (handle, receiver_rx) = ConnectionHandle::new(chrono::Utc::now());
        presence.register(receiver.clone(), handle).await;

        Fixture {
            tracker,
            rooms,
            sender,
            receiver,
            receiver_rx,
        }
    }

    fn typing_flags(rx: &mut UnboundedReceiver<Outbound>) -> Vec<bool> {
        let mut flags = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let Outbound::Event(ServerEvent::UserTyping(notice)) = item {
                flags.push(notice.typing);
            }
        }
        flags
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_keeps_single_timer() {
        let mut f = fixture().await;

        f.tracker.start(&f.sender, f.receiver.id, None).await;
        tokio::time::sleep(Duration::from_millis(2000)).await;
        f.tracker.start(&f.sender, f.receiver.id, None).await;
        assert_eq!(f.tracker.active_count().await, 1);

        // 第一个计时器原本的到期时间已过，不应有 typing:false
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true, true]);
        assert!(f.tracker.is_typing(f.sender.id).await);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        assert_eq!(typing_flags(&mut f.receiver_rx), vec![false]);
        assert!(!f.tracker.is_typing(f.sender.id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry_synthesizes_exactly_one_stop() {
        let mut f = fixture().await;

        f.tracker.start(&f.sender, f.receiver.id, None).await;
        tokio::time::sleep(Duration::from_millis(3001)).await;
        tokio::time::sleep(Duration::from_millis(10_000)).await;

        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true, false]);
        assert_eq!(f.tracker.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_explicit_stop_cancels_timer() {
        let mut f = fixture().await;

        f.tracker.start(&f.sender, f.receiver.id, None).await;
        f.tracker.stop(&f.sender, f.receiver.id, None).await;
        f.tracker.stop(&f.sender, f.receiver.id, None).await;
        tokio::time::sleep(Duration::from_millis(5000)).await;

        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true, false, false]);
        assert_eq!(f.tracker.active_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_conversation_room_receives_typing() {
        let f = fixture().await;
        let [room, _] = room_keys_for(f.sender.id, f.receiver.id);
        let (watcher, mut watcher_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.rooms.join_key(&watcher, &room).await;

        f.tracker
            .start(&f.sender, f.receiver.id, Some(room.clone()))
            .await;
        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(typing_flags(&mut watcher_rx), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_room_is_not_broadcast_to() {
        let mut f = fixture().await;
        let foreign = personal_room(UserId::from(Uuid::new_v4()));
        let (bystander, mut bystander_rx) = ConnectionHandle::new(chrono::Utc::now());
        f.rooms.join_key(&bystander, &foreign).await;

        f.tracker
            .start(&f.sender, f.receiver.id, Some(foreign.clone()))
            .await;
        f.tracker
            .stop(&f.sender, f.receiver.id, Some(foreign))
            .await;

        assert!(typing_flags(&mut bystander_rx).is_empty());
        // 接收者本人照常收到
        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_registered_while_lock_contended() {
        let mut f = fixture().await;

        // 占住计时器表，超过一个超时周期后再放开
        let guard = f.tracker.inner.timers.lock().await;
        let start = {
            let tracker = f.tracker.clone();
            let sender = f.sender.clone();
            let receiver = f.receiver.id;
            tokio::spawn(async move { tracker.start(&sender, receiver, None).await })
        };
        tokio::time::sleep(Duration::from_millis(5000)).await;
        drop(guard);
        start.await.unwrap();

        assert!(f.tracker.is_typing(f.sender.id).await);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!f.tracker.is_typing(f.sender.id).await);
        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_is_silent() {
        let mut f = fixture().await;
        f.tracker.start(&f.sender, f.receiver.id, None).await;
        f.tracker.clear(f.sender.id).await;
        tokio::time::sleep(Duration::from_millis(5000)).await;
        assert_eq!(typing_flags(&mut f.receiver_rx), vec![true]);
    }
}
