//! Offline map renderer: spots known map features in a description, places
//! each in a compass zone and draws before/after panels as emoji SVG.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapFeature {
    pub name: &'static str,
    pub emoji: &'static str,
}

const fn feature(name: &'static str, emoji: &'static str) -> MapFeature {
    MapFeature { name, emoji }
}

pub const FEATURES: &[MapFeature] = &[
    feature("river", "\u{1F30A}"),
    feature("lake", "\u{1F4A7}"),
    feature("pond", "\u{1F4A6}"),
    feature("woodland", "\u{1F332}"),
    feature("park", "\u{1F333}"),
    feature("garden", "\u{1F338}"),
    feature("farmland", "\u{1F33E}"),
    feature("beach", "\u{1F3D6}\u{FE0F}"),
    feature("housing", "\u{1F3E0}"),
    feature("apartments", "\u{1F3E2}"),
    feature("hotel", "\u{1F3E8}"),
    feature("restaurant", "\u{1F37D}\u{FE0F}"),
    feature("cafe", "\u{2615}"),
    feature("shop", "\u{1F3EC}"),
    feature("supermarket", "\u{1F6D2}"),
    feature("market", "\u{1F6CD}\u{FE0F}"),
    feature("office", "\u{1F3E2}"),
    feature("factory", "\u{1F3ED}"),
    feature("warehouse", "\u{1F3DA}\u{FE0F}"),
    feature("post office", "\u{1F4EE}"),
    feature("bank", "\u{1F3E6}"),
    feature("community centre", "\u{1F3DB}\u{FE0F}"),
    feature("school", "\u{1F3EB}"),
    feature("university", "\u{1F393}"),
    feature("hospital", "\u{1F3E5}"),
    feature("museum", "\u{1F5BC}\u{FE0F}"),
    feature("library", "\u{1F4DA}"),
    feature("theatre", "\u{1F3AD}"),
    feature("cinema", "\u{1F39E}\u{FE0F}"),
    feature("road", "\u{1F6E3}\u{FE0F}"),
    feature("bridge", "\u{1F309}"),
    feature("railway", "\u{1F686}"),
    feature("pier", "\u{1F6F3}\u{FE0F}"),
    feature("airport", "\u{2708}\u{FE0F}"),
    feature("car park", "\u{1F17F}\u{FE0F}"),
    feature("stadium", "\u{26BD}"),
    feature("tennis court", "\u{1F3BE}"),
    feature("amphitheatre", "\u{1F3B6}"),
    feature("play area", "\u{1F6DD}"),
    feature("fountain", "\u{26F2}"),
    feature("golf course", "\u{26F3}"),
    feature("accommodation", "\u{1F6D6}"),
    feature("reception", "\u{1FAAA}"),
];

const COMPASS: &str = "north|south|east|west|centre|center|middle";

static BEFORE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bbefore\b").expect("valid before regex"));
static AFTER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bafter\b|\bdevelop(?:ed|ment)\b").expect("valid after regex"));
static SPLIT_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bafter\b").expect("valid split regex"));
static COMPASS_WORD_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"\b(?:{COMPASS})\b")).expect("valid compass regex"));
static NEARBY_REGEXES: LazyLock<Vec<(&'static MapFeature, Regex)>> = LazyLock::new(|| {
    FEATURES
        .iter()
        .filter_map(|feature| {
            let name = regex::escape(feature.name);
            let pattern = format!(
                r"\b(?:{COMPASS})\b[^.]{{0,50}}\b{name}\b|\b{name}\b[^.]{{0,50}}\b(?:{COMPASS})\b"
            );
            Regex::new(&pattern).ok().map(|regex| (feature, regex))
        })
        .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    North,
    South,
    West,
    East,
    Center,
}

impl Zone {
    const ORDER: [Zone; 5] = [Zone::North, Zone::South, Zone::West, Zone::East, Zone::Center];

    fn position(self) -> (u32, u32) {
        match self {
            Zone::North => (250, 80),
            Zone::South => (250, 330),
            Zone::West => (100, 200),
            Zone::East => (400, 200),
            Zone::Center => (250, 200),
        }
    }

    fn from_word(word: &str) -> Zone {
        match word {
            "north" => Zone::North,
            "south" => Zone::South,
            "east" => Zone::East,
            "west" => Zone::West,
            _ => Zone::Center,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlacedFeature {
    pub feature: &'static MapFeature,
    pub zone: Zone,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapSketch {
    pub compare: bool,
    pub before: Vec<PlacedFeature>,
    pub after: Vec<PlacedFeature>,
}

impl MapSketch {
    pub fn from_text(text: &str) -> Self {
        let text = text.to_lowercase().replace('_', " ");
        let compare = BEFORE_REGEX.is_match(&text) && AFTER_REGEX.is_match(&text);

        let detected: Vec<PlacedFeature> = NEARBY_REGEXES
            .iter()
            .filter(|(feature, _)| text.contains(feature.name))
            .map(|(feature, nearby)| PlacedFeature {
                feature: *feature,
                zone: nearby
                    .find(&text)
                    .and_then(|found| COMPASS_WORD_REGEX.find(found.as_str()))
                    .map(|word| Zone::from_word(word.as_str()))
                    .unwrap_or(Zone::Center),
            })
            .collect();

        if !compare {
            return Self {
                compare,
                before: Vec::new(),
                after: detected,
            };
        }

        let mut parts = SPLIT_REGEX.splitn(&text, 2);
        let before_text = parts.next().unwrap_or_default();
        let after_text = parts.next().unwrap_or_default();
        let pick = |section: &str| {
            detected
                .iter()
                .copied()
                .filter(|placed| section.contains(placed.feature.name))
                .collect::<Vec<_>>()
        };
        Self {
            compare,
            before: pick(before_text),
            after: pick(after_text),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    pub fn to_svg(&self) -> String {
        let mut svg = String::from(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"1000\" height=\"400\" viewBox=\"0 0 1000 400\" style=\"font-family: Segoe UI Emoji, sans-serif;\">\n",
        );
        write_panel(&mut svg, "Before Development", 0, &self.before);
        write_panel(&mut svg, "After Development", 500, &self.after);
        svg.push_str("</svg>");
        svg
    }
}

fn write_panel(svg: &mut String, title: &str, x_offset: u32, items: &[PlacedFeature]) {
    let _ = writeln!(
        svg,
        "<rect x=\"{x_offset}\" y=\"0\" width=\"500\" height=\"400\" fill=\"#c6f5c6\"/>"
    );
    let _ = writeln!(
        svg,
        "<text x=\"{}\" y=\"40\" font-size=\"22\" text-anchor=\"middle\" font-weight=\"bold\">{title}</text>",
        x_offset + 250
    );
    for zone in Zone::ORDER {
        let here: Vec<&PlacedFeature> = items.iter().filter(|item| item.zone == zone).collect();
        if here.is_empty() {
            continue;
        }
        let (cx, cy) = zone.position();
        let emoji = here
            .iter()
            .map(|item| item.feature.emoji)
            .collect::<Vec<_>>()
            .join(" ");
        let label = here
            .iter()
            .map(|item| capitalize(item.feature.name))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(
            svg,
            "<text x=\"{}\" y=\"{cy}\" font-size=\"28\" text-anchor=\"middle\">{emoji}</text>",
            x_offset + cx
        );
        let _ = writeln!(
            svg,
            "<text x=\"{}\" y=\"{}\" font-size=\"12\" text-anchor=\"middle\" fill=\"#333\">{label}</text>",
            x_offset + cx,
            cy + 30
        );
    }
}

fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Two-panel SVG sketch of the features mentioned in `text`.
pub fn render(text: &str) -> String {
    MapSketch::from_text(text).to_svg()
}
