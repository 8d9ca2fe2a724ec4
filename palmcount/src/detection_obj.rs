// Shared detection types, kept apart from the engine and the exporters so both
// sides can depend on them.
use std::collections::BTreeMap;

pub const ABNORMAL_CLASS_ID: u32 = 0;
pub const NORMAL_CLASS_ID: u32 = 1;

/// One axis-aligned detection in original-image pixel space
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32, confidence: f32, class_id: u32) -> Self {
        Self {
            x1,
            y1,
            x2,
            y2,
            confidence,
            class_id,
        }
    }

    pub fn centroid(&self) -> (f64, f64) {
        (
            (self.x1 as f64 + self.x2 as f64) / 2.0,
            (self.y1 as f64 + self.y2 as f64) / 2.0,
        )
    }

    pub fn area(&self) -> f32 {
        (self.x2 - self.x1) * (self.y2 - self.y1)
    }

    pub fn intersection_area(&self, other: &Detection) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        if x2 > x1 && y2 > y1 {
            (x2 - x1) * (y2 - y1)
        } else {
            0.0
        }
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let intersection = self.intersection_area(other);
        let union = self.area() + other.area() - intersection;

        if union > 0.0 {
            intersection / union
        } else {
            0.0
        }
    }

    pub fn class(&self) -> DetectionClass {
        DetectionClass::from_id(self.class_id)
    }
}

/// How a class id is counted in progress and summary records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionClass {
    Abnormal,
    Normal,
    Unclassified,
}

impl DetectionClass {
    pub fn from_id(class_id: u32) -> Self {
        match class_id {
            ABNORMAL_CLASS_ID => DetectionClass::Abnormal,
            NORMAL_CLASS_ID => DetectionClass::Normal,
            _ => DetectionClass::Unclassified,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetectionCounts {
    pub abnormal: usize,
    pub normal: usize,
}

impl DetectionCounts {
    pub fn record(&mut self, detection: &Detection) {
        match detection.class() {
            DetectionClass::Abnormal => self.abnormal += 1,
            DetectionClass::Normal => self.normal += 1,
            DetectionClass::Unclassified => {}
        }
    }

    pub fn from_detections(detections: &[Detection]) -> Self {
        let mut counts = Self::default();
        for detection in detections {
            counts.record(detection);
        }
        counts
    }
}

/// Class id to display name table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassNames(BTreeMap<u32, String>);

impl ClassNames {
    pub fn default_palm() -> Self {
        let mut names = BTreeMap::new();
        names.insert(ABNORMAL_CLASS_ID, "abnormal".to_string());
        names.insert(NORMAL_CLASS_ID, "normal".to_string());
        Self(names)
    }

    /// Display name for a class id; unknown ids render as `class_{id}`.
    pub fn label(&self, class_id: u32) -> String {
        self.0
            .get(&class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{class_id}"))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &String)> {
        self.0.iter()
    }

    /// Parse the `names` metadata entry exported alongside YOLO models.
    ///
    /// The exporter writes a Python dict literal such as `{0: 'abnormal', 1: 'normal'}`;
    /// JSON objects with string keys are accepted as well. Returns `None` when nothing
    /// parseable is found.
    pub fn parse_metadata(raw: &str) -> Option<Self> {
        if let Ok(map) = serde_json::from_str::<BTreeMap<String, String>>(raw) {
            let names: BTreeMap<u32, String> = map
                .into_iter()
                .filter_map(|(k, v)| k.trim().parse().ok().map(|id| (id, v)))
                .collect();
            return (!names.is_empty()).then_some(Self(names));
        }

        let body = raw.trim().strip_prefix('{')?.strip_suffix('}')?;
        let mut names = BTreeMap::new();
        for entry in split_dict_entries(body) {
            let Some((key, value)) = entry.split_once(':') else {
                continue;
            };
            let Ok(id) = key.trim().parse::<u32>() else {
                continue;
            };
            let value = value.trim().trim_matches(|c| c == '\'' || c == '"');
            if !value.is_empty() {
                names.insert(id, value.to_string());
            }
        }

        (!names.is_empty()).then_some(Self(names))
    }
}

impl Default for ClassNames {
    fn default() -> Self {
        Self::default_palm()
    }
}

/// Split a dict body on commas that sit outside quoted strings.
fn split_dict_entries(body: &str) -> Vec<&str> {
    let mut entries = Vec::new();
    let mut quote: Option<char> = None;
    let mut start = 0;

    for (i, c) in body.char_indices() {
        match (quote, c) {
            (None, '\'' | '"') => quote = Some(c),
            (Some(q), c) if c == q => quote = None,
            (None, ',') => {
                entries.push(&body[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    entries.push(&body[start..]);
    entries
}
