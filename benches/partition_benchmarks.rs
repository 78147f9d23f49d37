//! Partitioner and copy-engine benchmarks: the index algebra and the two
//! copy fast paths run once per parameter per training step, so their cost
//! scales with model size and world size.

use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use daa_sharded_optimizer::param::{GradBufferDescriptor, ParamBufferView, ParamId, ParamIndexEntry};
use daa_sharded_optimizer::partition::{build_gbuf_range, world_partition};
use daa_sharded_optimizer::{copy, Dtype, ShardTensor};

fn synthetic_param_index(num_params: usize, param_numel: usize) -> (HashMap<ParamId, ParamIndexEntry>, usize) {
    let mut index = HashMap::with_capacity(num_params);
    let mut cursor = 0usize;
    for i in 0..num_params {
        index.insert(
            ParamId(i as u64),
            ParamIndexEntry { world_order: i as u64, world_start: cursor, world_end: cursor + param_numel },
        );
        cursor += param_numel;
    }
    (index, cursor)
}

fn bench_world_partition(c: &mut Criterion) {
    let mut group = c.benchmark_group("world_partition");
    for world_size in [8usize, 64, 512] {
        let numel = 64 * 1024 * 1024;
        group.throughput(Throughput::Elements(world_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(world_size), &world_size, |b, &w| {
            b.iter(|| black_box(world_partition(numel, w).unwrap()));
        });
    }
    group.finish();
}

fn bench_build_gbuf_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("build_gbuf_range");
    for num_params in [64usize, 1024, 8192] {
        let (index, padded_numel) = synthetic_param_index(num_params, 4096);
        group.throughput(Throughput::Elements(num_params as u64));
        group.bench_with_input(BenchmarkId::from_parameter(num_params), &num_params, |b, _| {
            b.iter(|| black_box(build_gbuf_range(padded_numel, 0, 8, &index).unwrap()));
        });
    }
    group.finish();
}

fn bench_copy_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_engine");
    for shard_numel in [4096usize, 65536, 1 << 20] {
        let grad_buffer = GradBufferDescriptor::new(Dtype::F32, shard_numel);
        *grad_buffer.data.write() = vec![1.0; shard_numel];
        let param_view = ParamBufferView::from_grad_buffer(&grad_buffer, Dtype::F32).unwrap();
        let shard = ShardTensor { data: vec![2.0; shard_numel], ..Default::default() };
        let world_range = daa_sharded_optimizer::Range::new(0, shard_numel).unwrap();

        group.throughput(Throughput::Elements(shard_numel as u64));
        group.bench_with_input(BenchmarkId::from_parameter(shard_numel), &shard_numel, |b, _| {
            b.iter(|| {
                copy::copy_shard_to_paramview(black_box(&shard), world_range, black_box(&param_view)).unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_world_partition, bench_build_gbuf_range, bench_copy_engine);
criterion_main!(benches);
