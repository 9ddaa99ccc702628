//! Table formatting utilities for structured output.

use comfy_table::{
    Attribute, Cell, CellAlignment, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL,
};

use crate::store::{QuantizationReport, RouterMemoryReport, SearchHit};
use crate::vector::CacheStats;

/// Builder for creating formatted tables.
pub struct TableBuilder {
    table: Table,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    /// Create a new table builder.
    pub fn new() -> Self {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.apply_modifier(UTF8_ROUND_CORNERS);
        Self { table }
    }

    /// Set the table headers.
    pub fn set_headers(mut self, headers: Vec<&str>) -> Self {
        let header_cells: Vec<Cell> = headers
            .into_iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
            .collect();
        self.table.set_header(header_cells);
        self
    }

    /// Add a row to the table.
    pub fn add_row(mut self, row: Vec<String>) -> Self {
        self.table.add_row(row);
        self
    }

    /// Add a row with the first cell in bold.
    pub fn add_total_row(mut self, row: Vec<String>) -> Self {
        let cells: Vec<Cell> = row
            .into_iter()
            .map(|value| Cell::new(value).add_attribute(Attribute::Bold))
            .collect();
        self.table.add_row(cells);
        self
    }

    /// Build and return the formatted table.
    pub fn build(self) -> String {
        self.table.to_string()
    }
}

/// Ranked search hits.
pub fn create_hits_table(hits: &[SearchHit]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);

    table.set_header(vec![
        Cell::new("#").add_attribute(Attribute::Bold),
        Cell::new("Score").add_attribute(Attribute::Bold),
        Cell::new("Shard").add_attribute(Attribute::Bold),
        Cell::new("Id").add_attribute(Attribute::Bold),
        Cell::new("Text").add_attribute(Attribute::Bold),
    ]);

    for (rank, hit) in hits.iter().enumerate() {
        table.add_row(vec![
            Cell::new(rank + 1),
            Cell::new(format!("{:.4}", hit.score)).set_alignment(CellAlignment::Right),
            Cell::new(hit.shard),
            Cell::new(hit.id),
            Cell::new(hit.display_text()),
        ]);
    }

    table.to_string()
}

/// Per-shard memory usage with a total row.
pub fn create_memory_table(report: &RouterMemoryReport) -> String {
    let headers = vec!["Shard", "Entries", "Live", "Index", "Texts", "Metadata", "Total"];
    let row = |label: String, r: &crate::store::MemoryReport| {
        vec![
            label,
            r.entries.to_string(),
            r.live_entries.to_string(),
            format_bytes(r.index_bytes),
            format_bytes(r.text_bytes),
            format_bytes(r.metadata_bytes),
            format_bytes(r.total_bytes),
        ]
    };

    let mut builder = TableBuilder::new().set_headers(headers);
    for (i, shard) in report.shards.iter().enumerate() {
        builder = builder.add_row(row(i.to_string(), shard));
    }
    builder
        .add_total_row(row("TOTAL".to_string(), &report.total))
        .build()
}

/// Before/after memory per quantized shard.
pub fn create_quantization_table(reports: &[QuantizationReport]) -> String {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.apply_modifier(UTF8_ROUND_CORNERS);

    table.set_header(vec![
        Cell::new("Shard").add_attribute(Attribute::Bold),
        Cell::new("Width").add_attribute(Attribute::Bold),
        Cell::new("Entries").add_attribute(Attribute::Bold),
        Cell::new("Before").add_attribute(Attribute::Bold),
        Cell::new("After").add_attribute(Attribute::Bold),
        Cell::new("Saved").add_attribute(Attribute::Bold),
    ]);

    for (i, report) in reports.iter().enumerate() {
        let saved = report.bytes_before as f64 - report.bytes_after as f64;
        let ratio = if report.bytes_before > 0 {
            saved / report.bytes_before as f64 * 100.0
        } else {
            0.0
        };
        let color = if saved > 0.0 { Color::Green } else { Color::Yellow };

        table.add_row(vec![
            Cell::new(i),
            Cell::new(report.width),
            Cell::new(report.entries),
            Cell::new(format_bytes(report.bytes_before)),
            Cell::new(format_bytes(report.bytes_after)),
            Cell::new(format!("{ratio:.1}%")).fg(color),
        ]);
    }

    table.to_string()
}

/// Embedding cache counters.
pub fn create_cache_table(stats: &CacheStats) -> String {
    TableBuilder::new()
        .set_headers(vec!["Cache", "Value"])
        .add_row(vec!["Entries".to_string(), format!("{}/{}", stats.len, stats.capacity)])
        .add_row(vec!["Hits".to_string(), stats.hits.to_string()])
        .add_row(vec!["Misses".to_string(), stats.misses.to_string()])
        .add_row(vec!["Evictions".to_string(), stats.evictions.to_string()])
        .add_row(vec![
            "Hit rate".to_string(),
            format!("{:.1}%", stats.hit_rate() * 100.0),
        ])
        .build()
}

/// Human-readable byte count.
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}
