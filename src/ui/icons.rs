pub struct Icons;

impl Icons {
    pub const MAP: &str = "🗺️";
    pub const PIN: &str = "📍";
    pub const CAMERA: &str = "📷";
    pub const CHECK: &str = "✅";
    pub const CROSS: &str = "❌";
    pub const INFO: &str = "ℹ️";
    pub const NEW: &str = "✨";
    pub const EDIT: &str = "📝";
    pub const DEL: &str = "🗑️";
    pub const DATABASE: &str = "🗄️";
    pub const RADAR: &str = "📡";
    pub const GEAR: &str = "⚙️";
}
