use crate::{Coordinates, LocateError};
use std::collections::HashMap;
use std::path::Path;

/// Kilometre markers of one highway, keyed by km rounded to a tenth (`"12.5"`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HighwayTable {
    markers: HashMap<String, Coordinates>,
}

impl HighwayTable {
    pub fn load(path: &Path) -> Result<Self, LocateError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| LocateError::Table(format!("{}: {err}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Parses `{"<km>": [lat, lon], ...}`.
    pub fn from_json(raw: &str) -> Result<Self, LocateError> {
        let entries: HashMap<String, (f64, f64)> =
            serde_json::from_str(raw).map_err(|err| LocateError::Table(err.to_string()))?;
        let mut markers = HashMap::with_capacity(entries.len());
        for (km, (lat, lon)) in entries {
            let key = normalize_marker(&km).map_err(|_| {
                LocateError::Table(format!("invalid kilometre key: {km}"))
            })?;
            markers.insert(key, Coordinates { lat, lon });
        }
        Ok(Self { markers })
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn lookup(&self, km: &str) -> Result<Coordinates, LocateError> {
        let key = normalize_marker(km)?;
        self.markers
            .get(&key)
            .copied()
            .ok_or(LocateError::UnknownMarker(key))
    }
}

/// `"12.000"` → `"12.0"`, `"12.500"` → `"12.5"`, `"7.46"` → `"7.5"`.
pub fn normalize_marker(km: &str) -> Result<String, LocateError> {
    let cleaned = km.trim().replace(',', ".");
    let value: f64 = cleaned
        .parse()
        .map_err(|_| LocateError::Shape(format!("kilometre is not a number: {km}")))?;
    if !value.is_finite() {
        return Err(LocateError::Shape(format!("kilometre is not finite: {km}")));
    }
    Ok(format!("{:.1}", (value * 10.0).round() / 10.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn markers_round_to_a_tenth() {
        assert_eq!(normalize_marker("12.000").as_deref(), Ok("12.0"));
        assert_eq!(normalize_marker("12.500").as_deref(), Ok("12.5"));
        assert_eq!(normalize_marker(" 7,46 ").as_deref(), Ok("7.5"));
        assert_eq!(normalize_marker("3").as_deref(), Ok("3.0"));
        assert!(matches!(normalize_marker("km"), Err(LocateError::Shape(_))));
    }

    #[test]
    fn load_normalizes_keys() {
        let mut file = NamedTempFile::new().expect("temp file");
        file.write_all(br#"{"12.50": [48.1, 15.2], "13": [48.2, 15.3]}"#)
            .expect("write table");

        let table = HighwayTable::load(file.path()).expect("table");
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.lookup("12.500").expect("12.5"),
            Coordinates { lat: 48.1, lon: 15.2 }
        );
        assert_eq!(
            table.lookup("13.000").expect("13.0"),
            Coordinates { lat: 48.2, lon: 15.3 }
        );
    }

    #[test]
    fn bad_tables_are_rejected() {
        assert!(matches!(
            HighwayTable::from_json(r#"{"x": [1.0, 2.0]}"#),
            Err(LocateError::Table(_))
        ));
        assert!(matches!(
            HighwayTable::from_json("[]"),
            Err(LocateError::Table(_))
        ));
        assert!(HighwayTable::default().is_empty());
    }
}
