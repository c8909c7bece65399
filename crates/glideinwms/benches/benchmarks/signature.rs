use std::hint::black_box;

use criterion::{BatchSize, BenchmarkId, Criterion};
use glideinwms::Map;
use glideinwms::classad::ClassAd;
use glideinwms::crypto::{SigningKey, sign_ad, verify_ad};

fn request_ad(params: usize) -> ClassAd {
    let mut ad = ClassAd::new("glideclient", "cred1_entry1@gfactory@factory@main.frontend")
        .with("ClientName", "frontend.main")
        .with("ReqIdleGlideins", 10)
        .with("ReqMaxGlideins", 100);
    for index in 0..params {
        ad.insert(format!("GlideinParam{index}"), format!("value{index}"));
    }
    ad
}

fn bench_sign_request(c: &mut Criterion) {
    let key = SigningKey::generate("main-key").unwrap();
    for params in [0, 20, 200] {
        c.bench_with_input(
            BenchmarkId::new("sign request", params),
            &params,
            |b, &params| {
                b.iter_batched_ref(
                    || request_ad(params),
                    |ad| sign_ad(black_box(ad), &key).unwrap(),
                    BatchSize::SmallInput,
                );
            },
        );
    }
}

fn bench_verify_request(c: &mut Criterion) {
    let key = SigningKey::generate("main-key").unwrap();
    let mut keys = Map::default();
    keys.insert(key.id().to_string(), key.clone());
    for params in [0, 20, 200] {
        let mut ad = request_ad(params);
        sign_ad(&mut ad, &key).unwrap();
        c.bench_with_input(
            BenchmarkId::new("verify request", params),
            &ad,
            |b, ad| {
                b.iter(|| verify_ad(black_box(ad), &keys).unwrap());
            },
        );
    }
}

pub fn benchmark(c: &mut Criterion) {
    bench_sign_request(c);
    bench_verify_request(c);
}
