use criterion::{criterion_group, criterion_main, Criterion};
use onair_core::{Cursor, Folder, Item, Rundown};
use onair_sync::broadcast::BroadcastGroup;
use onair_sync::config::EngineConfig;
use onair_sync::engine::{Origin, RecordingPublisher, RundownEngine};
use onair_sync::protocol::{PeerInfo, PeerRole, RoomEvent, SyncMessage, TimerUpdate};
use onair_sync::reorder::{drop_index, move_within, SiblingBounds};
use onair_sync::storage::{unix_millis, RundownStore, StoreConfig};
use std::hint::black_box;
use std::sync::Arc;
use tokio::time::Instant;
use uuid::Uuid;

fn rundown(folders: usize, items_per_folder: usize) -> Rundown {
    let items = (0..folders)
        .map(|f| {
            Folder::with_items(
                format!("Folder {f}"),
                (0..items_per_folder).map(|i| Item::new(format!("Item {f}.{i}"), 30)).collect(),
            )
        })
        .collect();
    Rundown::with_id(Uuid::new_v4(), "Benchmark", items)
}

fn timer_event(room: Uuid, elapsed: u64) -> RoomEvent {
    RoomEvent::Timer {
        room,
        update: TimerUpdate {
            is_running: true,
            time_elapsed: Some(elapsed),
            cursor: Some(Cursor::new(0, 1)),
        },
    }
}

fn bench_timer_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let event = timer_event(Uuid::new_v4(), 42);

    c.bench_function("timer_update_encode", |b| {
        b.iter(|| {
            let msg = black_box(&event).to_message(black_box(peer)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_timer_decode(c: &mut Criterion) {
    let encoded = timer_event(Uuid::new_v4(), 42)
        .to_message(Uuid::new_v4())
        .unwrap()
        .encode()
        .unwrap();

    c.bench_function("timer_update_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(RoomEvent::from_message(&msg).unwrap());
        })
    });
}

fn bench_structure_encode(c: &mut Criterion) {
    let doc = rundown(20, 10);
    let event = RoomEvent::StructureReplace {
        room: doc.id,
        items: doc.items.clone(),
    };
    let peer = Uuid::new_v4();

    c.bench_function("structure_replace_encode_200_items", |b| {
        b.iter(|| {
            let msg = black_box(&event).to_message(peer).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_engine_apply_remote(c: &mut Criterion) {
    let doc = rundown(10, 10);
    let room = doc.id;
    let mut engine = RundownEngine::new(EngineConfig::default(), RecordingPublisher::new());
    engine.attach(room);
    engine.load_document(doc);
    let now = Instant::now();

    c.bench_function("engine_apply_remote_timer", |b| {
        let mut elapsed = 0u64;
        b.iter(|| {
            elapsed += 1;
            black_box(engine.apply(timer_event(room, elapsed), Origin::Remote, now));
        })
    });
}

fn bench_engine_tick_auto_advance(c: &mut Criterion) {
    let doc = rundown(50, 40);
    let room = doc.id;

    c.bench_function("engine_tick_jump_2000_items", |b| {
        b.iter(|| {
            let publisher = RecordingPublisher::new();
            let mut engine = RundownEngine::new(EngineConfig::default(), publisher.clone());
            engine.attach(room);
            engine.load_document(doc.clone());
            let start = Instant::now();
            engine.start(start);
            // Jump most of the way through the rundown in one tick.
            let later = start + std::time::Duration::from_secs(50 * 40 * 30 - 10);
            black_box(engine.tick(later));
            black_box(publisher.take());
        })
    });
}

fn bench_drop_index(c: &mut Criterion) {
    let siblings: Vec<SiblingBounds> = (0..500)
        .map(|i| SiblingBounds::new(i as f64 * 40.0, i as f64 * 40.0 + 36.0))
        .collect();

    c.bench_function("drop_index_500_siblings", |b| {
        b.iter(|| black_box(drop_index(black_box(&siblings), black_box(9_999.0))))
    });
}

fn bench_move_within(c: &mut Criterion) {
    let items: Vec<Item> = (0..500).map(|i| Item::new(format!("Item {i}"), 30)).collect();

    c.bench_function("move_within_500_items", |b| {
        b.iter(|| {
            let mut list = items.clone();
            black_box(move_within(&mut list, black_box(499), black_box(0)));
        })
    });
}

fn bench_broadcast_100_peers(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_raw_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(1024);

                let mut receivers = Vec::new();
                for i in 0..100 {
                    let peer = PeerInfo::new(format!("Peer{i}"), PeerRole::Follower);
                    receivers.push(group.add_peer(peer).await);
                }

                let data = Arc::new(vec![0u8; 64]);
                black_box(group.broadcast_raw(Uuid::nil(), black_box(data)));
            });
        })
    });
}

fn bench_store_apply_timer(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("onair_bench_apply_timer_{}", Uuid::new_v4()));
    let store = RundownStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let doc = rundown(10, 10);
    store.save_rundown(&doc).unwrap();

    c.bench_function("store_apply_timer_event", |b| {
        let mut elapsed = 0u64;
        b.iter(|| {
            elapsed += 1;
            store
                .apply_event(black_box(&timer_event(doc.id, elapsed)), unix_millis())
                .unwrap();
        })
    });

    let _ = std::fs::remove_dir_all(&dir);
}

fn bench_store_load_rundown(c: &mut Criterion) {
    let dir = std::env::temp_dir().join(format!("onair_bench_load_rundown_{}", Uuid::new_v4()));
    let store = RundownStore::open(StoreConfig {
        path: dir.clone(),
        ..StoreConfig::default()
    })
    .unwrap();
    let doc = rundown(20, 10);
    store.save_rundown(&doc).unwrap();

    c.bench_function("load_rundown_200_items", |b| {
        b.iter(|| black_box(store.load_rundown(black_box(doc.id)).unwrap()))
    });

    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_timer_encode,
    bench_timer_decode,
    bench_structure_encode,
    bench_engine_apply_remote,
    bench_engine_tick_auto_advance,
    bench_drop_index,
    bench_move_within,
    bench_broadcast_100_peers,
    bench_store_apply_timer,
    bench_store_load_rundown,
);
criterion_main!(benches);
