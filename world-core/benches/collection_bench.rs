use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use world_core::world::scopes;
use world_core::{Coord, StoreConfig, World};

fn fresh_world() -> World {
    World::in_memory(&StoreConfig::default()).unwrap()
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_append");
    for size in [10u64, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_with_setup(fresh_world, |world| {
                for id in 0..size {
                    world.inventory_tools.append(&1, black_box(id)).unwrap();
                }
            });
        });
    }
    group.finish();
}

fn bench_swap_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("collection_remove");
    for size in [10u64, 100, 1_000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter_with_setup(
                || {
                    let world = fresh_world();
                    for id in 0..size {
                        world.inventory_tools.append(&1, id).unwrap();
                    }
                    world
                },
                |world| {
                    // Front removals force a swap on every call
                    for id in 0..size {
                        world.inventory_tools.remove_by_value(&1, black_box(id)).unwrap();
                    }
                },
            );
        });
    }
    group.finish();
}

fn bench_position_lookup(c: &mut Criterion) {
    let world = fresh_world();
    for id in 0..1_000u64 {
        world.inventory_tools.append(&1, id).unwrap();
    }
    c.bench_function("position_of_1000", |b| {
        b.iter(|| world.inventory_tools.position_of(&1, black_box(777)).unwrap())
    });
}

fn bench_spatial_move(c: &mut Criterion) {
    let world = fresh_world();
    let a = Coord::new(0, 0);
    let b_tile = Coord::new(1, 0);
    for id in 0..100u64 {
        world.tile_monsters.append(a, id).unwrap();
    }
    c.bench_function("spatial_move_round_trip", |b| {
        b.iter(|| {
            world.tile_monsters.move_element(black_box(42), a, b_tile).unwrap();
            world.tile_monsters.move_element(black_box(42), b_tile, a).unwrap();
        })
    });
}

fn bench_counter(c: &mut Criterion) {
    let world = fresh_world();
    let scope = scopes::order();
    c.bench_function("counter_next", |b| {
        b.iter(|| world.counters.next(black_box(&scope)).unwrap())
    });
}

criterion_group!(
    benches,
    bench_append,
    bench_swap_remove,
    bench_position_lookup,
    bench_spatial_move,
    bench_counter
);
criterion_main!(benches);
