//! Benchmark-only crate; the benchmarks live under `benches/`.
