//! SVG charts of the index
//!
//! Small self-contained renderer; the charts are for a quick look in the
//! browser, not for exact plotting.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::ServerError;
use crate::index::CacheIndex;
use crate::stats::{age_days_histogram, hit_count_histogram};

const WIDTH: f64 = 500.0;
const HEIGHT: f64 = 500.0;
const MARGIN: f64 = 60.0;

/// Maximum number of bars in the total hits histogram
pub const MAX_TOTAL_HITS_BUCKETS: usize = 25;

/// Entries accessed more recently than this are left out of the scatter plot
pub const SCATTER_MIN_ACCESS_AGE: f64 = 30.0;

type Rgb = (f64, f64, f64);

const HITS_LOW: Rgb = (1.0, 0.3, 0.1);
const HITS_HIGH: Rgb = (0.3, 1.0, 0.1);
const DAYS_LOW: Rgb = (1.0, 0.8, 0.1);
const DAYS_HIGH: Rgb = (0.3, 0.1, 0.8);

/// Charts served under `/image/{name}.svg`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    AgeHitsScatter,
    HitsHistogram,
    TotalHitsHistogram,
    DaysHistogram,
}

impl ChartKind {
    pub fn name(&self) -> &'static str {
        match self {
            ChartKind::AgeHitsScatter => "age_hits_scatter",
            ChartKind::HitsHistogram => "hits_histogram",
            ChartKind::TotalHitsHistogram => "total_hits_histogram",
            ChartKind::DaysHistogram => "days_histogram",
        }
    }

    /// Renders this chart for the current index
    pub fn render(&self, index: &CacheIndex, now: f64) -> String {
        match self {
            ChartKind::AgeHitsScatter => age_hits_scatter(index, now),
            ChartKind::HitsHistogram => hits_histogram(index),
            ChartKind::TotalHitsHistogram => total_hits_histogram(index),
            ChartKind::DaysHistogram => days_histogram(index, now),
        }
    }
}

impl FromStr for ChartKind {
    type Err = ServerError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.strip_suffix(".svg").unwrap_or(name);
        [
            ChartKind::AgeHitsScatter,
            ChartKind::HitsHistogram,
            ChartKind::TotalHitsHistogram,
            ChartKind::DaysHistogram,
        ]
        .into_iter()
        .find(|kind| kind.name() == name)
        .ok_or_else(|| ServerError::NotFound(format!("Chart {}", name)))
    }
}

impl fmt::Display for ChartKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Number of hashes per hit count
pub fn hits_histogram(index: &CacheIndex) -> String {
    let histogram = hit_count_histogram(index);
    let max = histogram.keys().next_back().copied().unwrap_or(0) as f64;
    let bars = histogram
        .iter()
        .map(|(&hits, &count)| Bar {
            label: hits.to_string(),
            value: count as f64,
            color: blend(HITS_LOW, HITS_HIGH, fraction(hits.saturating_sub(1) as f64, max)),
        })
        .collect::<Vec<_>>();
    bar_chart("number of hits", "number of hashes", &bars)
}

/// Number of hashes per age in days
pub fn days_histogram(index: &CacheIndex, now: f64) -> String {
    let histogram = age_days_histogram(index, now);
    let max = histogram.keys().next_back().copied().unwrap_or(0) as f64;
    let bars = histogram
        .iter()
        .map(|(&days, &count)| Bar {
            label: days.to_string(),
            value: count as f64,
            color: blend(DAYS_LOW, DAYS_HIGH, fraction(days.saturating_sub(1) as f64, max)),
        })
        .collect::<Vec<_>>();
    bar_chart("number of days", "number of hashes", &bars)
}

/// Total hits contributed by each hit count, in at most 25 buckets
pub fn total_hits_histogram(index: &CacheIndex) -> String {
    let bars = total_hits_buckets(&hit_count_histogram(index), MAX_TOTAL_HITS_BUCKETS)
        .into_iter()
        .map(|bucket| Bar {
            label: if bucket.min < bucket.max {
                format!("{}-{}", bucket.min, bucket.max)
            } else {
                bucket.min.to_string()
            },
            value: bucket.total as f64,
            color: blend(HITS_LOW, HITS_HIGH, fraction(bucket.max as f64, 100.0)),
        })
        .collect::<Vec<_>>();
    bar_chart("number of hits", "total number of hits", &bars)
}

/// A run of consecutive hit counts merged into one bar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitsBucket {
    pub min: u64,
    pub max: u64,
    /// Sum of `hits * entries` over the run
    pub total: u64,
}

/// Groups hit counts `0..=max` into at most `max_buckets` equal runs.
///
/// Totals saturate at `u64::MAX`.
pub fn total_hits_buckets(histogram: &BTreeMap<u64, u64>, max_buckets: usize) -> Vec<HitsBucket> {
    let Some(&max_hits) = histogram.keys().next_back() else {
        return Vec::new();
    };
    let per_bucket = max_hits.saturating_add(1).div_ceil(max_buckets.max(1) as u64);
    let buckets = max_hits / per_bucket + 1;

    (0..buckets)
        .map(|bucket| {
            let min = bucket * per_bucket;
            let max = min.saturating_add(per_bucket - 1).min(max_hits);
            let total = histogram
                .range(min..=max)
                .fold(0u64, |total, (&hits, &count)| total.saturating_add(hits.saturating_mul(count)));
            HitsBucket { min, max, total }
        })
        .collect()
}

/// Time since insertion against time since last access, both on log scales
pub fn age_hits_scatter(index: &CacheIndex, now: f64) -> String {
    let points: Vec<(f64, f64, f64, u32)> = index
        .all()
        .filter(|(_, entry)| now - entry.access_time >= SCATTER_MIN_ACCESS_AGE)
        .map(|(hash, entry)| {
            let radius = ((entry.hits.max(1) as f64).ln() * 10.0).sqrt().max(1.5);
            let hue = u32::from_str_radix(&hash.as_str()[..6], 16).unwrap_or(0) % 360;
            (now - entry.insert_time, now - entry.access_time, radius, hue)
        })
        .collect();

    let max_age = points
        .iter()
        .map(|&(inserted, accessed, _, _)| inserted.max(accessed))
        .fold(SCATTER_MIN_ACCESS_AGE * 2.0, f64::max);
    let scale = |seconds: f64| (seconds.max(1.0).ln() / max_age.ln()).clamp(0.0, 1.0);
    let plot = WIDTH - 2.0 * MARGIN;

    let mut svg = svg_open();
    svg.push_str(&axes("inserted ago", "last access ago"));
    for (inserted, accessed, radius, hue) in points {
        let x = MARGIN + scale(inserted) * plot;
        let y = HEIGHT - MARGIN - scale(accessed) * plot;
        svg.push_str(&format!(
            r#"<circle cx="{:.1}" cy="{:.1}" r="{:.1}" fill="hsl({},70%,55%)" fill-opacity="0.7"/>"#,
            x, y, radius, hue
        ));
    }
    svg.push_str(&format!(
        r#"<text x="{:.0}" y="{:.0}" font-size="10" text-anchor="end">max {}</text>"#,
        WIDTH - MARGIN,
        MARGIN - 10.0,
        format_duration(max_age)
    ));
    svg.push_str("</svg>");
    svg
}

struct Bar {
    label: String,
    value: f64,
    color: Rgb,
}

fn bar_chart(x_label: &str, y_label: &str, bars: &[Bar]) -> String {
    let mut svg = svg_open();
    svg.push_str(&axes(x_label, y_label));

    let max_value = bars.iter().map(|bar| bar.value).fold(0.0, f64::max);
    let plot = WIDTH - 2.0 * MARGIN;
    if !bars.is_empty() && max_value > 0.0 {
        let slot = plot / bars.len() as f64;
        for (i, bar) in bars.iter().enumerate() {
            let height = bar.value / max_value * plot;
            let x = MARGIN + i as f64 * slot;
            svg.push_str(&format!(
                r#"<rect x="{:.1}" y="{:.1}" width="{:.1}" height="{:.1}" fill="{}"><title>{}: {}</title></rect>"#,
                x + slot * 0.1,
                HEIGHT - MARGIN - height,
                slot * 0.8,
                height,
                css_color(bar.color),
                bar.label,
                bar.value
            ));
            svg.push_str(&format!(
                r#"<text x="{:.1}" y="{:.1}" font-size="9" text-anchor="middle">{}</text>"#,
                x + slot / 2.0,
                HEIGHT - MARGIN + 12.0,
                bar.label
            ));
        }
        svg.push_str(&format!(
            r#"<text x="{:.0}" y="{:.0}" font-size="9" text-anchor="end">{}</text>"#,
            MARGIN - 4.0,
            MARGIN + 4.0,
            max_value
        ));
    }

    svg.push_str("</svg>");
    svg
}

fn svg_open() -> String {
    format!(
        r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w}" height="{h}" viewBox="0 0 {w} {h}" font-family="sans-serif" fill="white">"#,
        w = WIDTH,
        h = HEIGHT
    )
}

fn axes(x_label: &str, y_label: &str) -> String {
    let bottom = HEIGHT - MARGIN;
    let right = WIDTH - MARGIN;
    format!(
        concat!(
            r#"<line x1="{m}" y1="{b}" x2="{r}" y2="{b}" stroke="gray"/>"#,
            r#"<line x1="{m}" y1="{m}" x2="{m}" y2="{b}" stroke="gray"/>"#,
            r#"<text x="{cx}" y="{xl}" font-size="12" text-anchor="middle">{x_label}</text>"#,
            r#"<text x="15" y="{cy}" font-size="12" text-anchor="middle" transform="rotate(-90 15 {cy})">{y_label}</text>"#,
        ),
        m = MARGIN,
        b = bottom,
        r = right,
        cx = WIDTH / 2.0,
        xl = HEIGHT - 20.0,
        cy = HEIGHT / 2.0,
        x_label = x_label,
        y_label = y_label
    )
}

fn fraction(value: f64, max: f64) -> f64 {
    if max > 0.0 {
        value / max
    } else {
        0.0
    }
}

fn blend(low: Rgb, high: Rgb, f: f64) -> Rgb {
    let mix = |l: f64, h: f64| (l * (1.0 - f) + h * f).clamp(0.0, 1.0);
    (mix(low.0, high.0), mix(low.1, high.1), mix(low.2, high.2))
}

fn css_color((r, g, b): Rgb) -> String {
    format!("rgb({},{},{})", (r * 255.0).round(), (g * 255.0).round(), (b * 255.0).round())
}

fn format_duration(seconds: f64) -> String {
    let seconds = seconds.max(0.0);
    if seconds >= 86400.0 {
        format!("{:.0}d", seconds / 86400.0)
    } else if seconds >= 3600.0 {
        format!("{:.0}h", seconds / 3600.0)
    } else if seconds >= 60.0 {
        format!("{:.0}m", seconds / 60.0)
    } else {
        format!("{:.0}s", seconds)
    }
}
