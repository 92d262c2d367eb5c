//! Engine micro-benchmarks: remaining-length codec and topic-tree
//! matching.

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use emberq::codec::{read_remaining_length, write_remaining_length_tail};
use emberq::protocol::QoS;
use emberq::topic::TopicTree;

fn bench_remaining_length(c: &mut Criterion) {
    c.bench_function("remaining_length_encode", |b| {
        let mut scratch = [0u8; 4];
        b.iter(|| {
            for value in [0u32, 127, 16_383, 2_097_151, 268_435_455] {
                let n = write_remaining_length_tail(&mut scratch, black_box(value)).unwrap();
                black_box(n);
            }
        })
    });

    c.bench_function("remaining_length_decode", |b| {
        let encoded: Vec<Vec<u8>> = [0u32, 127, 16_383, 2_097_151, 268_435_455]
            .iter()
            .map(|v| {
                let mut scratch = [0u8; 4];
                let n = write_remaining_length_tail(&mut scratch, *v).unwrap();
                scratch[4 - n..].to_vec()
            })
            .collect();

        b.iter(|| {
            for buf in &encoded {
                black_box(read_remaining_length(black_box(buf)).unwrap());
            }
        })
    });
}

fn bench_topic_match(c: &mut Criterion) {
    let mut tree = TopicTree::new(256, 32);
    for building in 0..4 {
        for room in 0..8 {
            let leaf = tree
                .create(&format!("site/b{}/room{}/temp", building, room))
                .unwrap();
            tree.subscribe_at(leaf, QoS::AtMostOnce, room % 8);
        }
    }
    let wildcard = tree.create("site/+/room3/+").unwrap();
    tree.subscribe_at(wildcard, QoS::AtLeastOnce, 9);

    c.bench_function("topic_match_literal", |b| {
        b.iter(|| black_box(tree.match_topic(black_box("site/b2/room5/temp"))))
    });

    c.bench_function("topic_match_wildcard", |b| {
        b.iter(|| black_box(tree.match_topic(black_box("site/b1/room3/temp"))))
    });
}

criterion_group!(benches, bench_remaining_length, bench_topic_match);
criterion_main!(benches);
