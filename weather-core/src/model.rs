use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Readings for a single city, already formatted with their unit suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeatherRecord {
    pub temperature: String,
    pub humidity: String,
    pub visibility: String,
}

impl WeatherRecord {
    pub fn new(
        temperature: impl Into<String>,
        humidity: impl Into<String>,
        visibility: impl Into<String>,
    ) -> Self {
        Self {
            temperature: temperature.into(),
            humidity: humidity.into(),
            visibility: visibility.into(),
        }
    }

    /// Values in wire order: temperature, humidity, visibility.
    pub fn values(&self) -> [&str; 3] {
        [&self.temperature, &self.humidity, &self.visibility]
    }
}

/// A named entry of the city table, as it appears in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CityEntry {
    pub name: String,
    #[serde(flatten)]
    pub record: WeatherRecord,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableError {
    #[error("city table must contain at least one city")]
    Empty,

    #[error("city '{0}' is defined more than once")]
    Duplicate(String),

    #[error("invalid city name {0:?}: names must be non-empty, comma-free and not padded with whitespace")]
    InvalidName(String),

    #[error("reading {value:?} of city '{city}' must not contain a comma")]
    InvalidReading { city: String, value: String },
}

/// Fixed, ordered mapping from city name to its readings.
///
/// Iteration order is the order the entries were given in. A table is never
/// empty, so index 0 is always a valid selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CityTable {
    entries: Vec<CityEntry>,
}

impl CityTable {
    pub fn new(entries: impl IntoIterator<Item = CityEntry>) -> Result<Self, TableError> {
        let entries: Vec<CityEntry> = entries.into_iter().collect();

        if entries.is_empty() {
            return Err(TableError::Empty);
        }

        for (idx, entry) in entries.iter().enumerate() {
            let name = entry.name.as_str();
            if name.is_empty() || name.contains(',') || name.trim() != name {
                return Err(TableError::InvalidName(name.to_owned()));
            }

            if let Some(value) = entry.record.values().into_iter().find(|v| v.contains(',')) {
                return Err(TableError::InvalidReading {
                    city: name.to_owned(),
                    value: value.to_owned(),
                });
            }

            if entries[..idx].iter().any(|other| other.name == name) {
                return Err(TableError::Duplicate(name.to_owned()));
            }
        }

        Ok(Self { entries })
    }

    /// The table the broadcaster ships with.
    pub fn builtin() -> Self {
        let entries = [
            ("Brno", "24.4 C", "46.3 %", "98.2 %"),
            ("London", "18.1 C", "84.7 %", "63.1 %"),
            ("Paris", "32.7 C", "23.4 %", "99.7 %"),
        ]
        .into_iter()
        .map(|(name, t, h, v)| CityEntry {
            name: name.to_owned(),
            record: WeatherRecord::new(t, h, v),
        })
        .collect();

        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&WeatherRecord> {
        self.position(name).map(|idx| &self.entries[idx].record)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Entry at `idx`; panics when out of range, like slice indexing.
    pub fn entry(&self, idx: usize) -> &CityEntry {
        &self.entries[idx]
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &CityEntry> {
        self.entries.iter()
    }
}

impl Default for CityTable {
    fn default() -> Self {
        Self::builtin()
    }
}
