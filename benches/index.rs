use anyhow::{Context, Result};
use divan::{Bencher, black_box};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use blocktree::{BTreeIndex, InMemory, SUPERBLOCK};

const DEFAULT_SEED: u64 = 1;
const KEY_SIZE: u16 = 8;
const VALUE_SIZE: u16 = 8;
const BLOCK_SIZE: usize = 4096;

fn main() {
    divan::main()
}

fn new_index(num_blocks: u32) -> BTreeIndex<InMemory> {
    let cache = InMemory::new(BLOCK_SIZE, num_blocks);
    let mut index = BTreeIndex::new(KEY_SIZE, VALUE_SIZE, cache, true);
    index.attach(SUPERBLOCK, true).unwrap();
    index
}

struct Seeder {
    n: usize,
    rng: ChaCha8Rng,
}

impl Seeder {
    fn new(n: usize, seed: u64) -> Self {
        Seeder {
            n,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    fn seed(self, index: &mut BTreeIndex<InMemory>) -> Result<()> {
        for (i, (k, v)) in self.enumerate() {
            index
                .insert(&k, &v)
                .with_context(|| format!("failed to insert {i}th ({k:?}, {v:?})"))?;
        }
        Ok(())
    }
}

impl Iterator for Seeder {
    type Item = ([u8; 8], [u8; 8]);
    fn next(&mut self) -> Option<Self::Item> {
        if self.n == 0 {
            return None;
        }
        self.n -= 1;
        let key: u64 = self.rng.random();
        Some((key.to_be_bytes(), key.to_le_bytes()))
    }
}

#[divan::bench(args = [100, 1_000, 10_000])]
fn bench_insert(b: Bencher, n: usize) {
    b.counter(n).bench_local(move || {
        let mut index = new_index(1024);
        Seeder::new(black_box(n), DEFAULT_SEED)
            .seed(&mut index)
            .unwrap();
    });
}

#[divan::bench(args = [100, 1_000, 10_000])]
fn bench_lookup(b: Bencher, n: usize) {
    let mut index = new_index(1024);
    Seeder::new(n, DEFAULT_SEED).seed(&mut index).unwrap();
    let keys: Vec<[u8; 8]> = Seeder::new(n, DEFAULT_SEED).map(|(k, _)| k).collect();
    b.counter(n).bench_local(move || {
        for k in black_box(&keys) {
            let _ = black_box(index.lookup(k).unwrap());
        }
    });
}
