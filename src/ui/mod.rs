pub mod icons;
pub mod output;
pub mod table;
pub mod theme;

pub use icons::Icons;
pub use output::{
    changed, error, header, human_bytes, image_line, info, marker_line, muted, section, status,
    success, summary_row,
};
pub use table::{image_table, marker_table, nearby_table, stats_table, TableBuilder};
pub use theme::{theme, Theme};
