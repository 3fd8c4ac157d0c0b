//! 2-D scatter plot of a labelled batch, positioned by the visualization reducer.

use std::collections::BTreeMap;
use std::path::Path;

use plotters::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cluster::NOISE;
use crate::corpus::read_json_file;
use crate::linalg::embeddings_to_ndarray;
use crate::store::ModelSet;
use crate::{AppError, AppResult};

const PLOT_SIZE: (u32, u32) = (1200, 900);
const LIGHT_GREY: RGBColor = RGBColor(211, 211, 211);
const POINT_RADIUS: i32 = 3;

/// Human-written names for cluster ids.
///
/// Ids are only meaningful for the model version they were written against, so the map
/// records that version and is ignored for any other.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct DescriptionMap {
    #[serde(default)]
    pub model_version: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<i32, String>,
}

impl DescriptionMap {
    pub fn load(path: &Path) -> AppResult<Self> {
        read_json_file(path)
    }

    /// This map if it applies to `version`, otherwise an empty one.
    pub fn for_model(&self, version: &str) -> Self {
        match self.model_version.as_deref() {
            Some(v) if v != version => {
                warn!(
                    "Cluster descriptions were written for model {v}, current model is {version}; using placeholders"
                );
                Self::default()
            }
            _ => self.clone(),
        }
    }

    pub fn describe(&self, label: i32) -> String {
        match self.labels.get(&label) {
            Some(description) => description.clone(),
            None if label == NOISE => "Noise".to_string(),
            None => format!("Cluster {label}"),
        }
    }
}

pub fn plot_title(labels: &[i32]) -> String {
    let noise = labels.iter().filter(|&&l| l == NOISE).count();
    format!("Daily Arxiv Clusters -- obs: {}; noise: {}", labels.len(), noise)
}

fn padded_range(values: impl Iterator<Item = f64>) -> std::ops::Range<f64> {
    let (min, max) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !min.is_finite() || !max.is_finite() {
        return 0.0..1.0;
    }
    let pad = ((max - min) * 0.05).max(0.5);
    (min - pad)..(max + pad)
}

fn plot_err<E: std::fmt::Display>(e: E) -> AppError {
    AppError::Plot(e.to_string())
}

/// Render `batch` with its `labels` as an SVG scatter plot at `output`.
#[tracing::instrument(
    name = "Rendering plot",
    level = "info",
    skip(set, batch, labels, descriptions),
    fields(n = batch.len())
)]
pub fn render_plot(
    set: &ModelSet,
    batch: &[Vec<f32>],
    labels: &[i32],
    descriptions: &DescriptionMap,
    output: &Path,
) -> AppResult<()> {
    if labels.len() != batch.len() {
        return Err(AppError::DimensionMismatch {
            expected: batch.len(),
            found: labels.len(),
            row: 0,
        });
    }
    if set.visual.n_components() < 2 {
        return Err(AppError::Plot(format!(
            "visualization reducer has {} component(s), plotting needs 2",
            set.visual.n_components()
        )));
    }
    let data = embeddings_to_ndarray(batch, Some(set.visual.input_dim()))?;
    let coords = set.visual.transform(&data)?;
    let descriptions = descriptions.for_model(&set.version);

    let mut groups: BTreeMap<i32, Vec<(f64, f64)>> = BTreeMap::new();
    for (row, &label) in coords.rows().into_iter().zip(labels) {
        groups.entry(label).or_default().push((row[0], row[1]));
    }
    debug!("Plotting {} groups", groups.len());

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let root = SVGBackend::new(output, PLOT_SIZE).into_drawing_area();
    root.fill(&WHITE).map_err(plot_err)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(plot_title(labels), ("sans-serif", 28))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(40)
        .build_cartesian_2d(
            padded_range(coords.column(0).iter().copied()),
            padded_range(coords.column(1).iter().copied()),
        )
        .map_err(plot_err)?;
    chart.configure_mesh().draw().map_err(plot_err)?;

    // noise first so clusters are drawn on top of it
    for (&label, points) in &groups {
        let color = match label {
            NOISE => LIGHT_GREY,
            l => {
                let c = Palette99::pick(l as usize).to_rgba();
                RGBColor(c.0, c.1, c.2)
            }
        };
        chart
            .draw_series(
                points
                    .iter()
                    .map(move |&p| Circle::new(p, POINT_RADIUS, color.filled())),
            )
            .map_err(plot_err)?
            .label(descriptions.describe(label))
            .legend(move |(x, y)| Circle::new((x + 10, y), POINT_RADIUS + 1, color.filled()));
    }
    chart
        .configure_series_labels()
        .position(SeriesLabelPosition::UpperRight)
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()
        .map_err(plot_err)?;
    root.present().map_err(plot_err)?;
    info!("Wrote plot to {}", output.display());
    Ok(())
}
