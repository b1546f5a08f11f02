use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use pimqat::{
    Tensor,
    quantization::{QuantMode, QuantParams, fake_quant, fake_quant_backward},
    tensor::Conv2dParams,
};

fn fake_quant_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("fake_quant");
    for size in [1 << 12, 1 << 16] {
        let x = Tensor::random_seed(vec![size], 0);
        let grad = Tensor::full(vec![size], 1.0);
        let params = QuantParams {
            log2_t: -0.5,
            bits: 5,
            mode: QuantMode::Signed,
            round_threshold: false,
        };
        group.bench_with_input(BenchmarkId::new("forward", size), &x, |b, x| {
            b.iter(|| fake_quant(x, &params).expect("quantization failed"))
        });
        group.bench_with_input(BenchmarkId::new("backward", size), &x, |b, x| {
            b.iter(|| fake_quant_backward(x, &params, &grad).expect("backward failed"))
        });
    }
    group.finish();
}

fn conv_benchmark(c: &mut Criterion) {
    let input = Tensor::random_seed(vec![4, 16, 32, 32], 1);
    let weight = Tensor::random_seed(vec![32, 16, 3, 3], 2);
    let bias = Tensor::random_seed(vec![32], 3);
    let params = Conv2dParams::new(1, 1);
    c.bench_function("conv2d_16x32_3x3", |b| {
        b.iter(|| {
            input
                .conv2d(&weight, Some(&bias), &params)
                .expect("conv2d failed")
        })
    });
}

criterion_group!(benches, fake_quant_benchmark, conv_benchmark);
criterion_main!(benches);
