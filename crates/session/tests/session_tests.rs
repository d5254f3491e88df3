use somnia_rust_auth::{
    Identity, IdentityCallback, IdentitySource, IdentityWatch, IdentityWatchers,
};
use somnia_rust_session::{SessionEvent, SessionSynchronizer};
use somnia_rust_store::{
    Dream, DreamPatch, MemoryStore, Plan, ProfileStore, StoreError, UserProfile,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// HTTP を介さずにアイデンティティ変更を流せるテスト用プロバイダ
#[derive(Default)]
struct FakeProvider {
    current: Mutex<Option<Identity>>,
    watchers: IdentityWatchers,
}

impl FakeProvider {
    fn emit(&self, identity: Option<Identity>) {
        *self.current.lock().unwrap() = identity.clone();
        self.watchers.notify(identity);
    }
}

impl IdentitySource for FakeProvider {
    fn current_identity(&self) -> Option<Identity> {
        self.current.lock().unwrap().clone()
    }

    fn on_change(&self, callback: IdentityCallback) -> IdentityWatch {
        self.watchers.register(callback)
    }
}

/// 書き込み回数を数えるストアラッパー
struct CountingStore {
    inner: MemoryStore,
    upserts: AtomicUsize,
}

impl CountingStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            upserts: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ProfileStore for CountingStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
        self.inner.get_by_id(id).await
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        ProfileStore::upsert(&self.inner, profile).await
    }

    async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), StoreError> {
        self.inner.set_plan(id, plan).await
    }
}

/// 常に失敗するストア
struct FailingStore;

#[async_trait::async_trait]
impl ProfileStore for FailingStore {
    async fn get_by_id(&self, _id: &str) -> Result<Option<UserProfile>, StoreError> {
        Err(StoreError::DeserializationError("boom".to_string()))
    }

    async fn upsert(&self, _profile: &UserProfile) -> Result<(), StoreError> {
        Err(StoreError::DeserializationError("boom".to_string()))
    }

    async fn set_plan(&self, _id: &str, _plan: Plan) -> Result<(), StoreError> {
        Err(StoreError::DeserializationError("boom".to_string()))
    }
}

/// 取得だけが遅いストア
struct SlowStore {
    inner: MemoryStore,
    delay: Duration,
}

#[async_trait::async_trait]
impl ProfileStore for SlowStore {
    async fn get_by_id(&self, id: &str) -> Result<Option<UserProfile>, StoreError> {
        sleep(self.delay).await;
        self.inner.get_by_id(id).await
    }

    async fn upsert(&self, profile: &UserProfile) -> Result<(), StoreError> {
        ProfileStore::upsert(&self.inner, profile).await
    }

    async fn set_plan(&self, id: &str, plan: Plan) -> Result<(), StoreError> {
        self.inner.set_plan(id, plan).await
    }
}

fn identity(id: &str, email: &str) -> Identity {
    Identity {
        id: id.to_string(),
        email: email.to_string(),
    }
}

fn record_events(
    synchronizer: &SessionSynchronizer,
) -> (
    Arc<Mutex<Vec<SessionEvent>>>,
    somnia_rust_session::SessionSubscription,
) {
    let events: Arc<Mutex<Vec<SessionEvent>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let subscription = synchronizer.subscribe(move |event| {
        sink.lock().unwrap().push(event);
    });
    (events, subscription)
}

#[tokio::test]
async fn test_subscribe_receives_immediate_snapshot() {
    let provider = FakeProvider::default();
    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(MemoryStore::new()));

    let (events, _subscription) = record_events(&synchronizer);
    sleep(Duration::from_millis(50)).await;

    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0], SessionEvent::SignedOut);
}

#[tokio::test]
async fn test_existing_profile_resolves_without_writes() {
    let provider = FakeProvider::default();
    let memory = MemoryStore::new();
    ProfileStore::upsert(&memory, &UserProfile::free("user-1", "a@x.com"))
        .await
        .unwrap();
    let store = Arc::new(CountingStore::new(memory));

    let synchronizer = SessionSynchronizer::new(&provider, store.clone());
    let (events, _subscription) = record_events(&synchronizer);

    // 同じアイデンティティを二回解決する
    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(50)).await;
    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(50)).await;

    let events = events.lock().unwrap();
    let signed_in: Vec<_> = events.iter().filter(|e| e.is_signed_in()).collect();
    assert_eq!(signed_in.len(), 2);
    assert_eq!(signed_in[0], signed_in[1]);

    // 既存プロファイルの再解決は書き込みを増やさない
    assert_eq!(store.upserts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_profile_is_healed_with_one_upsert() {
    let provider = FakeProvider::default();
    let store = Arc::new(CountingStore::new(MemoryStore::new()));

    let synchronizer = SessionSynchronizer::new(&provider, store.clone());
    let (events, _subscription) = record_events(&synchronizer);
    sleep(Duration::from_millis(20)).await;

    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(store.upserts.load(Ordering::SeqCst), 1);

    let healed = store.get_by_id("user-1").await.unwrap().unwrap();
    assert_eq!(healed, UserProfile::free("user-1", "a@x.com"));

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.profile().map(|p| p.plan), Some(Plan::Free));
}

#[tokio::test]
async fn test_store_failure_fails_closed() {
    let provider = FakeProvider::default();
    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(FailingStore));
    let (events, _subscription) = record_events(&synchronizer);

    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(50)).await;

    // ストア障害はサインアウトとして扱われ、エラーは表に出ない
    assert_eq!(synchronizer.current(), SessionEvent::SignedOut);
    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| !e.is_signed_in()));
}

#[tokio::test]
async fn test_slow_fetch_never_overtakes_sign_out() {
    let provider = FakeProvider::default();
    let memory = MemoryStore::new();
    ProfileStore::upsert(&memory, &UserProfile::free("user-1", "a@x.com"))
        .await
        .unwrap();
    let store = Arc::new(SlowStore {
        inner: memory,
        delay: Duration::from_millis(200),
    });

    let synchronizer = SessionSynchronizer::new(&provider, store);
    let (events, _subscription) = record_events(&synchronizer);

    // A のプロファイル取得より先にサインアウトが届く
    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(10)).await;
    provider.emit(None);

    sleep(Duration::from_millis(600)).await;

    // 遅い取得の結果は破棄され、最終状態はサインアウトのまま
    assert_eq!(synchronizer.current(), SessionEvent::SignedOut);
    let events = events.lock().unwrap();
    assert!(events.iter().all(|e| !e.is_signed_in()));
}

#[tokio::test]
async fn test_rapid_sign_ins_resolve_in_delivery_order() {
    let provider = FakeProvider::default();
    let memory = MemoryStore::new();
    ProfileStore::upsert(&memory, &UserProfile::free("user-a", "a@x.com"))
        .await
        .unwrap();
    ProfileStore::upsert(&memory, &UserProfile::free("user-b", "b@x.com"))
        .await
        .unwrap();

    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(memory));
    let (events, _subscription) = record_events(&synchronizer);
    sleep(Duration::from_millis(20)).await;

    provider.emit(Some(identity("user-a", "a@x.com")));
    provider.emit(Some(identity("user-b", "b@x.com")));
    sleep(Duration::from_millis(100)).await;

    let events = events.lock().unwrap();
    let last = events.last().unwrap();
    assert_eq!(last.profile().map(|p| p.id.as_str()), Some("user-b"));
}

#[tokio::test]
async fn test_unsubscribe_stops_only_that_handler() {
    let provider = FakeProvider::default();
    let memory = MemoryStore::new();
    ProfileStore::upsert(&memory, &UserProfile::free("user-1", "a@x.com"))
        .await
        .unwrap();

    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(memory));
    let (dropped_events, dropped) = record_events(&synchronizer);
    let (kept_events, _kept) = record_events(&synchronizer);
    sleep(Duration::from_millis(50)).await;

    drop(dropped);
    let dropped_len = dropped_events.lock().unwrap().len();

    provider.emit(Some(identity("user-1", "a@x.com")));
    sleep(Duration::from_millis(50)).await;

    // 解除済みハンドラには届かない
    assert_eq!(dropped_events.lock().unwrap().len(), dropped_len);
    // 他のサブスクライバには届く
    assert!(kept_events.lock().unwrap().last().unwrap().is_signed_in());
}

#[tokio::test]
async fn test_existing_session_is_seeded_at_construction() {
    let provider = FakeProvider::default();
    *provider.current.lock().unwrap() = Some(identity("user-1", "a@x.com"));

    let memory = MemoryStore::new();
    ProfileStore::upsert(&memory, &UserProfile::free("user-1", "a@x.com"))
        .await
        .unwrap();

    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(memory));
    sleep(Duration::from_millis(50)).await;

    assert!(synchronizer.current().is_signed_in());
}

#[tokio::test]
async fn test_sign_out_skips_store_access() {
    let provider = FakeProvider::default();
    // FailingStore でもサインアウトはストアに触れないため成功する
    let synchronizer = SessionSynchronizer::new(&provider, Arc::new(FailingStore));

    provider.emit(None);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(synchronizer.current(), SessionEvent::SignedOut);
}

// DreamPatch/Dream はセッションの関心外だが、ストア契約が夢側でも
// そのまま動くことを軽く確認しておく。
#[tokio::test]
async fn test_memory_store_serves_both_contracts() {
    use somnia_rust_store::DreamStore;

    let store = MemoryStore::new();
    ProfileStore::upsert(&store, &UserProfile::free("user-1", "a@x.com"))
        .await
        .unwrap();

    let dream = Dream::new("user-1", "flying");
    DreamStore::upsert(&store, &dream).await.unwrap();
    store
        .update_partial(
            "user-1",
            &dream.id,
            DreamPatch {
                content: Some("flying low".to_string()),
                chat_history: None,
            },
        )
        .await
        .unwrap();

    let listed = store.list_for_user("user-1").await.unwrap();
    assert_eq!(listed[0].content, "flying low");
}
