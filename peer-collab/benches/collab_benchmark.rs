use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};
use peer_collab::cipher::{self, CipherKey, KEY_SIZE};
use peer_collab::presence::{Awareness, AwarenessOrigin};
use peer_collab::protocol::{Message, SyncMessage};
use peer_collab::signaling::{Envelope, RelayMessage};
use peer_collab::sync;
use serde_json::json;
use yrs::{Doc, Text, Transact};

fn doc_with_text(len: usize) -> Doc {
    let doc = Doc::new();
    let text = doc.get_or_insert_text("content");
    let mut txn = doc.transact_mut();
    text.insert(&mut txn, 0, &"x".repeat(len));
    drop(txn);
    doc
}

fn bench_message_encode(c: &mut Criterion) {
    let msg = Message::Sync(SyncMessage::Update(vec![0u8; 64]));

    c.bench_function("message_encode_64B", |b| {
        b.iter(|| black_box(black_box(&msg).encode()))
    });
}

fn bench_message_decode(c: &mut Criterion) {
    let encoded = Message::Sync(SyncMessage::Update(vec![0u8; 64])).encode();

    c.bench_function("message_decode_64B", |b| {
        b.iter(|| black_box(Message::decode(black_box(&encoded)).unwrap()))
    });
}

fn bench_sync_step1(c: &mut Criterion) {
    let doc = doc_with_text(1024);

    c.bench_function("sync_step1_1kb_doc", |b| {
        b.iter(|| black_box(sync::step1(black_box(&doc))))
    });
}

fn bench_sync_step2_full(c: &mut Criterion) {
    let doc = doc_with_text(1024);
    let empty_sv = match sync::step1(&Doc::new()) {
        SyncMessage::SyncStep1(sv) => sv,
        _ => unreachable!(),
    };

    c.bench_function("sync_step2_1kb_doc", |b| {
        b.iter(|| black_box(sync::step2(black_box(&doc), black_box(&empty_sv)).unwrap()))
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let awareness = Awareness::new(1);
    awareness.set_local_state(Some(json!({
        "user": {"name": "bench", "color": "#30bced"},
        "cursor": {"anchor": 10, "head": 20},
    })));
    let ids = awareness.client_ids();

    c.bench_function("awareness_encode_local", |b| {
        b.iter(|| black_box(awareness.encode_update(black_box(&ids))))
    });
}

fn bench_awareness_apply_100(c: &mut Criterion) {
    let mut update = Vec::new();
    for id in 1..=100u64 {
        let peer = Awareness::new(id);
        peer.set_local_state(Some(json!({"name": format!("user-{id}")})));
        update.push(peer.encode_update(&[id]));
    }

    c.bench_function("awareness_apply_100_clients", |b| {
        b.iter(|| {
            let local = Awareness::new(1000);
            for u in &update {
                black_box(local.apply_update(u, AwarenessOrigin::Remote).unwrap());
            }
        })
    });
}

fn bench_encrypt_announce(c: &mut Criterion) {
    let key = CipherKey::from_bytes([7u8; KEY_SIZE]);
    let value = Envelope::announce("4b1d6e0a-51a4-4c6e-8a8f-0c1f5b9d2e31")
        .to_value()
        .unwrap();

    c.bench_function("cipher_encrypt_announce", |b| {
        b.iter(|| black_box(cipher::encrypt(&key, black_box(&value)).unwrap()))
    });
}

fn bench_decrypt_announce(c: &mut Criterion) {
    let key = CipherKey::from_bytes([7u8; KEY_SIZE]);
    let value = Envelope::announce("4b1d6e0a-51a4-4c6e-8a8f-0c1f5b9d2e31")
        .to_value()
        .unwrap();
    let token = cipher::encrypt(&key, &value).unwrap();

    c.bench_function("cipher_decrypt_announce", |b| {
        b.iter(|| black_box(cipher::decrypt(&key, black_box(&token)).unwrap()))
    });
}

fn bench_relay_publish_parse(c: &mut Criterion) {
    let frame = RelayMessage::publish("room", json!({"type": "announce", "from": "peer"}))
        .to_json()
        .unwrap();

    c.bench_function("relay_publish_parse", |b| {
        b.iter(|| black_box(RelayMessage::parse(black_box(&frame)).unwrap()))
    });
}

criterion_group!(
    benches,
    bench_message_encode,
    bench_message_decode,
    bench_sync_step1,
    bench_sync_step2_full,
    bench_awareness_encode,
    bench_awareness_apply_100,
    bench_encrypt_announce,
    bench_decrypt_announce,
    bench_relay_publish_parse,
);
criterion_main!(benches);
