use tabled::{settings::Style, Table, Tabled};

use crate::marker::{format_timestamp, Image, Marker};
use crate::ui::human_bytes;

#[derive(Tabled)]
pub struct TableRow {
    #[tabled(rename = "Metric")]
    pub metric: String,
    #[tabled(rename = "Value")]
    pub value: String,
}

#[derive(Tabled)]
struct MarkerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Location")]
    location: String,
    #[tabled(rename = "Images")]
    images: usize,
    #[tabled(rename = "Created")]
    created: String,
}

#[derive(Tabled)]
struct ImageRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "URI")]
    uri: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Added")]
    added: String,
}

#[derive(Tabled)]
struct NearbyRow {
    #[tabled(rename = "Title")]
    title: String,
    #[tabled(rename = "Distance")]
    distance: String,
    #[tabled(rename = "ID")]
    id: String,
}

pub struct TableBuilder {
    rows: Vec<TableRow>,
}

impl Default for TableBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TableBuilder {
    pub fn new() -> Self {
        Self { rows: Vec::new() }
    }

    pub fn add_row(&mut self, label: &str, value: &str) {
        self.rows.push(TableRow {
            metric: label.to_string(),
            value: value.to_string(),
        });
    }

    pub fn build(&self) -> String {
        render(&self.rows)
    }
}

fn render<T: Tabled>(rows: &[T]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

pub fn stats_table(stats: &[(&str, &str)]) -> String {
    let mut builder = TableBuilder::new();
    for (label, value) in stats {
        builder.add_row(label, value);
    }
    builder.build()
}

pub fn marker_table(markers: &[Marker]) -> String {
    let rows: Vec<MarkerRow> = markers
        .iter()
        .map(|marker| MarkerRow {
            id: marker.id.clone(),
            title: marker.title.clone(),
            location: marker.coordinate.to_string(),
            images: marker.images.len(),
            created: format_timestamp(&marker.created_at),
        })
        .collect();
    render(&rows)
}

pub fn image_table(images: &[Image]) -> String {
    let rows: Vec<ImageRow> = images
        .iter()
        .map(|image| ImageRow {
            id: image.id.clone(),
            name: image.name.clone(),
            uri: image.uri.clone(),
            size: image.size.map(human_bytes).unwrap_or_else(|| "-".to_string()),
            added: format_timestamp(&image.date_added),
        })
        .collect();
    render(&rows)
}

/// Rows of `(marker, distance in metres)`
pub fn nearby_table(found: &[(&Marker, f64)]) -> String {
    let rows: Vec<NearbyRow> = found
        .iter()
        .map(|(marker, distance)| NearbyRow {
            title: marker.title.clone(),
            distance: format!("{:.0} m", distance),
            id: marker.id.clone(),
        })
        .collect();
    render(&rows)
}
