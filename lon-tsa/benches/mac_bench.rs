use criterion::{black_box, criterion_group, criterion_main, Criterion};
use lon_proto::{DomainId, SubnetNode};
use lon_tsa::auth::{challenger_block, mac};
use lon_tsa::tables::AuthKey;

fn bench_mac(c: &mut Criterion) {
    let std_key = AuthKey::Std([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
    let oma_key = AuthKey::Oma([0x22; 12]);
    let nonce = [7u8; 8];
    let apdu: Vec<u8> = (0..64u8).collect();
    let block = challenger_block(&DomainId::new(&[0x49]), SubnetNode::new(1, 2));

    c.bench_function("mac_std_64b", |b| {
        b.iter(|| mac(black_box(&std_key), &nonce, black_box(&apdu), None))
    });
    c.bench_function("mac_oma_64b", |b| {
        b.iter(|| mac(black_box(&oma_key), &nonce, black_box(&apdu), Some(&block)))
    });
}

criterion_group!(benches, bench_mac);
criterion_main!(benches);
