use crate::marker::{Image, Marker};
use crate::ui::{theme, Icons};
use owo_colors::OwoColorize;

pub fn header(text: &str) {
    println!("{} {}", Icons::MAP, text.style(theme().header));
}

pub fn status(icon: &str, label: &str, value: &str) {
    println!("{} {}: {}", icon, label.style(theme().dim), value);
}

pub fn success(label: &str) {
    changed(Icons::CHECK, label);
}

/// Success line under a command-specific icon
pub fn changed(icon: &str, label: &str) {
    println!("{}", changed_line(icon, label));
}

fn changed_line(icon: &str, label: &str) -> String {
    format!("{} {}", icon, label.style(theme().success))
}

pub fn error(label: &str) {
    eprintln!("{} {}", Icons::CROSS, label.style(theme().error));
}

pub fn info(label: &str, value: &str) {
    println!(
        "{} {}: {}",
        Icons::INFO.style(theme().info),
        label.style(theme().dim),
        value
    );
}

pub fn section(title: &str) {
    println!();
    println!("━{}━", title.style(theme().header));
}

pub fn muted(text: &str) -> String {
    text.style(theme().muted).to_string()
}

/// `📍 Title (lat, lon)  id  [n images]`
pub fn marker_line(marker: &Marker) {
    let images = match marker.images.len() {
        0 => String::new(),
        1 => "  [1 image]".to_string(),
        n => format!("  [{} images]", n),
    };
    println!(
        "{} {} ({}){}  {}",
        Icons::PIN,
        marker.title.style(theme().header),
        marker.coordinate.to_string().style(theme().location),
        images,
        marker.id.style(theme().muted)
    );
}

pub fn image_line(image: &Image) {
    let size = image.size.map(human_bytes).unwrap_or_default();
    println!(
        "  {} {} {} {}",
        Icons::CAMERA,
        image.name,
        image.uri.style(theme().muted),
        size.style(theme().dim)
    );
}

pub fn summary_row(label: &str, value: &str) {
    println!("  {} {}", label.style(theme().dim), value);
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
