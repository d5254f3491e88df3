use crate::event::SessionEvent;
use log::{debug, warn};
use somnia_rust_auth::{Identity, IdentitySource, IdentityWatch};
use somnia_rust_store::{ProfileStore, UserProfile};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// セッション変更通知のコールバック
pub type SessionCallback = Box<dyn Fn(SessionEvent) + Send + Sync>;

type SubscriberMap = Arc<RwLock<HashMap<Uuid, SessionCallback>>>;

/// アクティブなセッション購読を表す
///
/// Drop した時点でこのハンドラへの配信は止まる。他のサブスクライバや、
/// シンクロナイザが保持するプロバイダ側の監視には影響しない。
pub struct SessionSubscription {
    id: Uuid,
    subscribers: SubscriberMap,
}

impl Drop for SessionSubscription {
    fn drop(&mut self) {
        if let Ok(mut subscribers) = self.subscribers.write() {
            subscribers.remove(&self.id);
        }
    }
}

/// セッションシンクロナイザ本体
///
/// アイデンティティ変更を配信順に一つずつ解決し、解決結果を全サブスク
/// ライバへ通知する。ストア障害時は「未サインイン」へ倒す。
pub struct SessionSynchronizer {
    subscribers: SubscriberMap,
    current: Arc<RwLock<SessionEvent>>,
    // Dropping this unregisters us from the provider and ends the resolver
    // task (the queue sender lives inside the watch callback).
    _watch: IdentityWatch,
}

impl SessionSynchronizer {
    /// 新しいシンクロナイザを作成
    ///
    /// プロバイダとプロファイルストアは明示的に注入する。Tokio ランタイム
    /// 上で呼び出すこと（内部で解決タスクを spawn する）。
    pub fn new(provider: &dyn IdentitySource, profiles: Arc<dyn ProfileStore>) -> Self {
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let current = Arc::new(RwLock::new(SessionEvent::SignedOut));

        // Each delivery is stamped with a sequence number at enqueue time.
        // `delivered` therefore always holds the newest delivered sequence,
        // which is what stale-result suppression compares against.
        let delivered = Arc::new(AtomicU64::new(0));
        let (queue_tx, mut queue_rx) = mpsc::unbounded_channel::<(u64, Option<Identity>)>();

        // Seed with the provider's current belief so the synchronizer starts
        // from an existing session instead of a blank one.
        let seed_seq = delivered.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = queue_tx.send((seed_seq, provider.current_identity()));

        let watch = {
            let queue_tx = queue_tx.clone();
            let delivered = delivered.clone();
            provider.on_change(Box::new(move |identity| {
                let seq = delivered.fetch_add(1, Ordering::SeqCst) + 1;
                let _ = queue_tx.send((seq, identity));
            }))
        };
        drop(queue_tx);

        let task_subscribers = subscribers.clone();
        let task_current = current.clone();
        let task_delivered = delivered.clone();
        tokio::spawn(async move {
            // FIFO processing keeps resolutions in delivery order; an old
            // notification can never finish after a newer one has started.
            while let Some((seq, identity)) = queue_rx.recv().await {
                let event = resolve(identity, profiles.as_ref()).await;

                if seq < task_delivered.load(Ordering::SeqCst) {
                    // A newer change arrived while the store fetch was in
                    // flight; its resolution is next in the queue.
                    debug!("discarding superseded session resolution (seq {})", seq);
                    continue;
                }

                {
                    let mut current = task_current.write().unwrap();
                    *current = event.clone();
                }

                let subscribers = task_subscribers.read().unwrap();
                debug!(
                    "emitting session event to {} subscribers (signed_in: {})",
                    subscribers.len(),
                    event.is_signed_in()
                );
                for callback in subscribers.values() {
                    callback(event.clone());
                }
            }
            debug!("session resolver task finished");
        });

        Self {
            subscribers,
            current,
            _watch: watch,
        }
    }

    /// セッション変更の購読を登録
    ///
    /// 登録直後に、現在の状態を反映した呼び出しが一度だけ非同期で届く。
    /// サブスクライバが同期的に状態を待つ必要はない。
    pub fn subscribe<F>(&self, callback: F) -> SessionSubscription
    where
        F: Fn(SessionEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap()
            .insert(id, Box::new(callback));

        // Deliver the snapshot as of registration to just this subscriber,
        // off the caller's stack.
        let event = self.current.read().unwrap().clone();
        let subscribers = self.subscribers.clone();
        tokio::spawn(async move {
            let subscribers = subscribers.read().unwrap();
            if let Some(callback) = subscribers.get(&id) {
                callback(event);
            }
        });

        SessionSubscription {
            id,
            subscribers: self.subscribers.clone(),
        }
    }

    /// 現在のセッション状態のスナップショットを取得
    pub fn current(&self) -> SessionEvent {
        self.current.read().unwrap().clone()
    }
}

async fn resolve(identity: Option<Identity>, profiles: &dyn ProfileStore) -> SessionEvent {
    let identity = match identity {
        Some(identity) => identity,
        // Signed out: no store access at all.
        None => return SessionEvent::SignedOut,
    };

    match profiles.get_by_id(&identity.id).await {
        Ok(Some(profile)) => SessionEvent::SignedIn(profile),
        Ok(None) => {
            // The identity exists upstream but its profile is missing: a
            // prior sign-up died between provider and store. Recreate the
            // document here instead of surfacing an error.
            let profile = UserProfile::free(&identity.id, &identity.email);
            match profiles.upsert(&profile).await {
                Ok(()) => SessionEvent::SignedIn(profile),
                Err(e) => {
                    warn!(
                        "failed to create missing profile for {}: {}; treating as signed out",
                        identity.id, e
                    );
                    SessionEvent::SignedOut
                }
            }
        }
        Err(e) => {
            // Fail closed: a half-resolved session is worse than a logout.
            warn!(
                "profile fetch failed for {}: {}; treating as signed out",
                identity.id, e
            );
            SessionEvent::SignedOut
        }
    }
}
