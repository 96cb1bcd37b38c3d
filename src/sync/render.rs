use serde::Serialize;

use super::snapshot::Snapshot;
use crate::model::ObjectType;
use crate::path::PathPoint;

/// One marker as handed to the map renderer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Marker {
    pub id: String,
    pub latitude: f64,
    pub longitude: f64,
    pub icon: String,
    pub color: Option<String>,
    pub selected: bool,
}

/// Draws markers and the followed object's path. Tile rendering and
/// styling live behind this.
pub trait MapRenderer {
    fn render(&mut self, markers: &[Marker], path: &[PathPoint]);
}

/// Icon and colour for a type tag: the active registry entry if there is
/// one, else a built-in icon for the common kinds.
pub fn icon_for(kind: &str, types: &[ObjectType]) -> (String, Option<String>) {
    if let Some(t) = types.iter().find(|t| t.is_active && t.name == kind) {
        return (t.icon.clone(), Some(t.color.clone()));
    }
    let icon = match kind.to_lowercase().as_str() {
        "ship" => "FiAnchor",
        "car" => "FiTruck",
        "airplane" => "FiSend",
        "drone" => "FiRadio",
        "truck" => "FiPackage",
        "navigation" => "FiNavigation",
        "person" => "FiUser",
        _ => "FiTag",
    };
    (icon.to_string(), None)
}

impl Snapshot {
    /// Markers for every visible object that has a position and whose type
    /// is not hidden, in view order.
    pub fn markers(&self) -> Vec<Marker> {
        self.view
            .iter()
            .filter(|e| !self.is_hidden(&e.object.kind))
            .filter_map(|e| {
                let position = e.position.as_ref()?;
                let (icon, color) = icon_for(&e.object.kind, &self.types);
                Some(Marker {
                    id: e.object.id.clone(),
                    latitude: position.latitude,
                    longitude: position.longitude,
                    icon,
                    color,
                    selected: self.followed.as_deref() == Some(e.object.id.as_str()),
                })
            })
            .collect()
    }

    pub fn render_to<R: MapRenderer + ?Sized>(&self, renderer: &mut R) {
        renderer.render(&self.markers(), &self.path);
    }
}
