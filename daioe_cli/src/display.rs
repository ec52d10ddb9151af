use comfy_table::{presets::NOTHING, *};
use daioe::catalog::OutputCatalog;
use daioe::fetch::{FetchOutcome, FetchSummary};
use daioe::pipeline::{CombineSummary, HierarchySummary, PipelineSummary};
use itertools::Itertools;

fn new_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .iter()
                .map(|h| Cell::new(h).add_attribute(Attribute::Bold))
                .collect_vec(),
        )
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::MiddleHeaderIntersections, '─')
        .set_style(comfy_table::TableComponent::HeaderLines, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    table
}

/// Two-column table with bold, right-aligned keys
fn key_value_table(rows: Vec<(&str, String)>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    for (key, value) in rows {
        table.add_row(vec![Cell::new(key).add_attribute(Attribute::Bold), value.into()]);
    }
    if let Some(column) = table.column_mut(0) {
        column.set_cell_alignment(CellAlignment::Right);
    }
    table
}

pub fn display_fetch_summary(summary: &FetchSummary) {
    let mut table = new_table(&["Table", "Status", "Rows", "Detail"]);
    for (id, outcome) in &summary.0 {
        let row = match outcome {
            FetchOutcome::Success { rows, path, .. } => vec![
                id.clone(),
                "ok".to_string(),
                rows.to_string(),
                path.display().to_string(),
            ],
            FetchOutcome::Failed { kind, message } => vec![
                id.clone(),
                format!("failed ({kind})"),
                String::new(),
                message.clone(),
            ],
        };
        table.add_row(row);
    }
    println!("\n{}", table);
    println!("Success: {}/{}", summary.succeeded(), summary.total());
}

pub fn display_combine_summary(summary: &CombineSummary) {
    let report = &summary.report;
    let mut rows = vec![
        ("Sources", summary.sources.join(", ")),
        ("Total rows", report.total_rows.to_string()),
        ("Duplicate rows", report.duplicate_rows.to_string()),
        ("Duplicate groups", report.duplicate_groups.to_string()),
        ("Conflicting groups", report.conflict_groups.to_string()),
        ("Resolved rows", report.resolved_rows.to_string()),
    ];
    if let Some(years) = &summary.years {
        rows.push(("Years", format!("{} - {}", years.min, years.max)));
    }
    rows.push(("Saved to", summary.path.display().to_string()));
    println!("\n{}", key_value_table(rows));

    if let Some(years) = &summary.years {
        let mut table = new_table(&["Year", "Rows"]);
        for (year, n) in &years.rows_per_year {
            table.add_row(vec![year.to_string(), n.to_string()]);
        }
        println!("\n{}", table);
    }
}

pub fn display_hierarchy_summary(summary: &HierarchySummary) {
    let mut table = new_table(&["Level", "Rows"]);
    for (level, rows) in &summary.rows_per_level {
        table.add_row(vec![level.clone(), rows.to_string()]);
    }
    println!("\n{}", table);

    let diagnostics = &summary.diagnostics;
    println!(
        "\n{}",
        key_value_table(vec![
            ("Unmapped rows", diagnostics.unmapped_rows.to_string()),
            ("Unique codes", diagnostics.unique_codes.to_string()),
            (
                "Unmapped codes",
                diagnostics
                    .unmapped_codes
                    .iter()
                    .map(|u| format!("{}:{}", u.level, u.ssyk_code))
                    .join(", "),
            ),
            ("Saved to", summary.path.display().to_string()),
        ])
    );
}

pub fn display_pipeline_summary(summary: &PipelineSummary) {
    println!(
        "\n{}",
        key_value_table(vec![
            ("Rows", summary.rows.to_string()),
            ("Columns", summary.columns.len().to_string()),
            ("Metrics", summary.metrics.join(", ")),
            ("Saved to", summary.path.display().to_string()),
        ])
    );
}

pub fn display_shape(rows: usize, columns: usize) {
    println!("Rows: {rows}, columns: {columns}");
}

pub fn display_catalog(catalog: &OutputCatalog) {
    println!(
        "\n{}",
        key_value_table(vec![
            ("Levels", catalog.levels.join(", ")),
            ("Sexes", catalog.sexes.join(", ")),
            ("Ages", catalog.ages.join(", ")),
            ("Years", catalog.years.iter().join(", ")),
        ])
    );
}
