//! Memory report - segment usage snapshot for tooling and logs

use crate::allocator::{BucketClassStats, MainStats};
use crate::manager::SharedMemoryManager;
use serde::Serialize;
use std::fmt;

/// Usage of one shared segment at a point in time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryReport {
    pub segment: String,
    pub segment_size: usize,
    pub writable: bool,
    /// Bytes of preloaded image data after the header
    pub image_bytes: usize,
    /// `None` once a compaction pass detached the allocators
    pub main: Option<MainStats>,
    pub buckets: Vec<BucketClassStats>,
    pub oom_count: u64,
}

impl MemoryReport {
    pub fn collect(manager: &SharedMemoryManager) -> Self {
        Self {
            segment: manager.name().to_string(),
            segment_size: manager.size(),
            writable: manager.is_writable(),
            image_bytes: manager.image_end().saturating_sub(crate::segment::HEADER_SIZE),
            main: manager.main_stats(),
            buckets: manager.bucket_stats(),
            oom_count: manager.oom_count(),
        }
    }

    /// Percentage of the main heap handed out, 0 without allocators
    pub fn utilization(&self) -> f64 {
        match self.main {
            Some(main) if main.free_bytes + main.allocated_bytes > 0 => {
                100.0 * main.allocated_bytes as f64 / (main.free_bytes + main.allocated_bytes) as f64
            }
            _ => 0.0,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for MemoryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Segment {} ({} bytes, {})", self.segment, self.segment_size, if self.writable { "read-write" } else { "read-only" })?;
        if self.image_bytes > 0 {
            writeln!(f, "  image:        {} bytes", self.image_bytes)?;
        }
        match &self.main {
            Some(main) => {
                writeln!(f, "  allocated:    {} bytes in {} blocks", main.allocated_bytes, main.used_blocks)?;
                writeln!(f, "  free:         {} bytes in {} blocks", main.free_bytes, main.free_blocks)?;
                writeln!(f, "  largest free: {} bytes", main.largest_free_block)?;
                writeln!(f, "  utilization:  {:.1}%", self.utilization())?;
            }
            None => writeln!(f, "  allocators detached (compacted image)")?,
        }
        if !self.buckets.is_empty() {
            writeln!(f, "  {:>6} {:>6} {:>8} {:>10} {:>10}", "class", "lists", "live", "reserved", "overhead")?;
            for class in &self.buckets {
                writeln!(
                    f,
                    "  {:>6} {:>6} {:>8} {:>10} {:>10}",
                    class.class_size, class.lists, class.live_slots, class.reserved_bytes, class.bookkeeping_bytes
                )?;
            }
        }
        write!(f, "  out-of-memory: {}", self.oom_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::CLASS_SIZES;
    use crate::manager::MemoryManager;
    use crate::segment::Segment;

    fn manager() -> SharedMemoryManager {
        let segment = Segment::anonymous(2 * 1024 * 1024).expect("segment");
        SharedMemoryManager::with_segment(segment, None).expect("manager")
    }

    #[test]
    fn test_collect_counts_live_slots() {
        let mut manager = manager();
        for _ in 0..3 {
            manager.alloc(10).expect("small");
        }
        manager.alloc(5000).expect("large");
        assert!(manager.alloc(1 << 30).is_err());

        let report = MemoryReport::collect(&manager);
        assert_eq!(report.segment_size, 2 * 1024 * 1024);
        assert!(report.writable);
        assert_eq!(report.image_bytes, 0);
        assert_eq!(report.oom_count, 1);
        assert_eq!(report.buckets.len(), CLASS_SIZES.len());
        let class16 = report.buckets.iter().find(|c| c.class_size == 16).expect("class 16");
        assert_eq!(class16.live_slots, 3);
        assert!(report.utilization() > 0.0 && report.utilization() < 100.0);
    }

    #[test]
    fn test_text_and_json() {
        let report = MemoryReport::collect(&manager());
        let text = report.to_string();
        assert!(text.starts_with("Segment anonymous"));
        assert!(text.contains("largest free"));
        assert!(text.ends_with("out-of-memory: 0"));

        let json: serde_json::Value = serde_json::from_str(&report.to_json().expect("json")).expect("parse");
        assert_eq!(json["segment_size"], 2 * 1024 * 1024);
        assert_eq!(json["buckets"].as_array().map(|b| b.len()), Some(CLASS_SIZES.len()));
    }
}
