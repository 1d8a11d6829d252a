//! Latency report printing.
//!
//! Formats the merged round-trip statistics of a measurement window.

use hm_core::stats::{BUCKET_NS, BUCKETS, LatencyStats};

/// Prints count, min, average and max round-trip latency followed by the
/// non-empty histogram buckets. Values switch from microseconds to
/// milliseconds once the average reaches one millisecond.
pub fn print_report(stats: &LatencyStats) {
    println!("\nLatency Metrics (Run Round Trip)");
    println!("Count: {}", stats.count);
    if stats.count == 0 {
        return;
    }

    let avg_ns = stats.avg();
    if avg_ns < 1_000_000.0 {
        println!("Min:   {:.2} us", stats.min as f64 / 1e3);
        println!("Avg:   {:.2} us", avg_ns / 1e3);
        println!("Max:   {:.2} us", stats.max as f64 / 1e3);
    } else {
        println!("Min:   {:.2} ms", stats.min as f64 / 1e6);
        println!("Avg:   {:.2} ms", avg_ns / 1e6);
        println!("Max:   {:.2} ms", stats.max as f64 / 1e6);
    }

    let width_us = BUCKET_NS / 1_000;
    println!("Distribution ({}us buckets):", width_us);
    for (i, &count) in stats.buckets.iter().enumerate() {
        if count > 0 {
            let range_end = if i == BUCKETS - 1 { ">" } else { "" };
            let lower = i as u64 * width_us;
            let upper = (i as u64 + 1) * width_us;
            println!("[{:4}-{:4}{} us]: {}", lower, upper, range_end, count);
        }
    }
}
