//! Report generation for demultiplexer sessions

use serde::Serialize;

use crate::processor::Demultiplexer;
use crate::psi::store::{StoreStats, TableSummary};
use crate::stats::ChannelStats;
use crate::t2mi::T2miSummary;

/// Snapshot of a session, serialisable as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub ts_time: String,
    pub packets: u64,
    pub null_packets: u64,
    pub invalid_packets: u64,
    pub channels: Vec<ChannelStats>,
    pub tables: Vec<TableSummary>,
    pub table_store: StoreStats,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub t2mi: Vec<T2miSummary>,
    /// Report of the transport stream rebuilt from an extracted PLP
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<NestedReport>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NestedReport {
    pub t2mi_pid: u16,
    pub plp: u8,
    #[serde(flatten)]
    pub report: Report,
}

/// Report generator for demultiplexer sessions
pub struct Reporter;

impl Reporter {
    /// Generate a structured report for API consumers
    pub fn create_report(demux: &Demultiplexer) -> Report {
        Report {
            ts_time: chrono::Utc::now().to_rfc3339(),
            packets: demux.packet_count(),
            null_packets: demux.null_packets,
            invalid_packets: demux.invalid_packets,
            channels: demux.stats(),
            tables: demux.store().summary(),
            table_store: demux.store().stats.clone(),
            t2mi: demux.t2mi_channels().map(|t2mi| t2mi.summary()).collect(),
            nested: None,
        }
    }

    /// Attach the report of a nested session.
    pub fn with_nested(mut report: Report, t2mi_pid: u16, plp: u8, nested: &Demultiplexer) -> Report {
        report.nested = Some(Box::new(NestedReport {
            t2mi_pid,
            plp,
            report: Self::create_report(nested),
        }));
        report
    }

    /// Generate pretty-printed JSON string for CLI output
    pub fn to_json(report: &Report) -> String {
        serde_json::to_string_pretty(report).unwrap_or_else(|_| "{\"error\": \"JSON serialization failed\"}".to_string())
    }

    pub fn generate_json_report(demux: &Demultiplexer) -> String {
        Self::to_json(&Self::create_report(demux))
    }
}
