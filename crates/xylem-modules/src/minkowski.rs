//! Pairwise Minkowski distances between labelled vectors.

use super::{ID_INPUT, ID_OUTPUT};
use regex::Regex;
use std::collections::BTreeMap;
use xylem::{
    ConfigError, InputPort, Module, ModuleCore, ModuleError, OutputPort, PipeKind, Properties,
};

pub const PROPERTY_INPUT_FORMAT: &str = "input format";
pub const PROPERTY_DELIMITER_INPUT_REGEX: &str = "input delimiter regex";
pub const PROPERTY_ORDER: &str = "order";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputFormat {
    Json,
    Csv,
}

/// Distance matrix over a table of labelled vectors.
///
/// CSV input: the header line lists the labels, every following line
/// starts with a label and continues with that label's values. JSON input:
/// an object mapping labels to arrays of numbers.
///
/// Output is a JSON object `label -> label -> distance` in which each label
/// is only compared with the labels sorting after it.
pub struct MinkowskiDistanceMatrix {
    core: ModuleCore,
    format: InputFormat,
    delimiter: Option<Regex>,
    order: f64,
}

impl MinkowskiDistanceMatrix {
    pub fn new(config: Properties) -> Self {
        let core = ModuleCore::new("Minkowski Distance Matrix")
            .with_category("Clustering")
            .with_description("Calculates the Minkowski distances between labelled vectors.")
            .property(
                PROPERTY_DELIMITER_INPUT_REGEX,
                r"[\,;]",
                "Regular expression to use as segmentation delimiter for CSV input.",
            )
            .property(PROPERTY_INPUT_FORMAT, "csv", "Format of input [json|csv].")
            .property(PROPERTY_ORDER, "2", "Order p of the distance (1 = Manhattan, 2 = Euclidean).")
            .input(
                InputPort::new(ID_INPUT, "CSV or JSON formatted table of labelled vectors.")
                    .accept(PipeKind::Char),
            )
            .output(
                OutputPort::new(ID_OUTPUT, "JSON formatted distance matrix.")
                    .accept(PipeKind::Char),
            )
            .configure(config);
        Self {
            core,
            format: InputFormat::Csv,
            delimiter: None,
            order: 2.0,
        }
    }

    fn read_vectors(&mut self) -> Result<BTreeMap<String, Vec<f64>>, ModuleError> {
        let text = self.core.reader(ID_INPUT)?.read_to_string()?;
        match (self.format, &self.delimiter) {
            (InputFormat::Csv, Some(delimiter)) => parse_csv(&text, delimiter),
            (InputFormat::Csv, None) => Err(ModuleError::Failed("properties not applied".into())),
            (InputFormat::Json, _) => serde_json::from_str(&text)
                .map_err(|e| ModuleError::InvalidInput(format!("invalid JSON: {e}"))),
        }
    }
}

impl Module for MinkowskiDistanceMatrix {
    fn core(&self) -> &ModuleCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut ModuleCore {
        &mut self.core
    }

    fn apply_properties(&mut self) -> Result<(), ConfigError> {
        self.core.apply()?;
        let props = self.core.properties();

        self.format = match props.get_choice(PROPERTY_INPUT_FORMAT, &["json", "csv"])? {
            "json" => InputFormat::Json,
            _ => InputFormat::Csv,
        };

        let pattern = props.get(PROPERTY_DELIMITER_INPUT_REGEX).unwrap_or_default();
        let delimiter = Regex::new(pattern)
            .map_err(|e| ConfigError::invalid(PROPERTY_DELIMITER_INPUT_REGEX, pattern, e))?;
        self.delimiter = Some(delimiter);

        let order: f64 = props.get_parsed(PROPERTY_ORDER)?;
        if !order.is_finite() || order < 1.0 {
            return Err(ConfigError::invalid(
                PROPERTY_ORDER,
                &order.to_string(),
                "must be a finite number of at least 1",
            ));
        }
        self.order = order;
        Ok(())
    }

    fn process(&mut self) -> Result<bool, ModuleError> {
        let vectors = self.read_vectors()?;
        let total = vectors.len();
        let matrix = distance_matrix(&vectors, self.order, |done| {
            self.core.report_progress(done as f64 / total as f64);
        })?;

        let json = serde_json::to_string_pretty(&matrix)
            .map_err(|e| ModuleError::Failed(format!("JSON serialization failed: {e}")))?;
        self.core.output_port_mut(ID_OUTPUT)?.write_text(&json)?;
        tracing::debug!(labels = total, order = self.order, "distance matrix written");
        Ok(true)
    }
}

/// Parse the delimited table format.
///
/// Empty lines, empty labels and empty value fields are skipped. Labels
/// that end up without values (such as an empty corner cell) are dropped.
fn parse_csv(text: &str, delimiter: &Regex) -> Result<BTreeMap<String, Vec<f64>>, ModuleError> {
    let mut lines = text
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((_, header)) = lines.next() else {
        return Ok(BTreeMap::new());
    };
    let mut vectors: BTreeMap<String, Vec<f64>> = delimiter
        .split(header)
        .map(|label| (label.trim().to_string(), Vec::new()))
        .collect();

    for (index, line) in lines {
        let mut fields = delimiter.split(line);
        let label = fields.next().unwrap_or_default().trim();
        if label.is_empty() {
            continue;
        }
        let vector = vectors.get_mut(label).ok_or_else(|| {
            ModuleError::InvalidInput(format!("line {}: label '{label}' is not in the header", index + 1))
        })?;
        for field in fields.map(str::trim).filter(|f| !f.is_empty()) {
            let value = field.parse::<f64>().map_err(|_| {
                ModuleError::InvalidInput(format!("line {}: '{field}' is not a number", index + 1))
            })?;
            vector.push(value);
        }
    }

    vectors.retain(|_, values| !values.is_empty());
    Ok(vectors)
}

/// Minkowski distance of order `p` between two equally long vectors.
pub fn minkowski_distance(a: &[f64], b: &[f64], p: f64) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs().powf(p))
        .sum::<f64>()
        .powf(1.0 / p)
}

/// Compare every label with the labels sorting after it.
///
/// `progress` is called with the number of labels finished so far.
pub fn distance_matrix(
    vectors: &BTreeMap<String, Vec<f64>>,
    p: f64,
    mut progress: impl FnMut(usize),
) -> Result<BTreeMap<String, BTreeMap<String, f64>>, ModuleError> {
    let entries: Vec<(&String, &Vec<f64>)> = vectors.iter().collect();
    let mut matrix = BTreeMap::new();

    for (i, (label, a)) in entries.iter().enumerate() {
        let mut row = BTreeMap::new();
        for (other, b) in &entries[i + 1..] {
            if a.len() != b.len() {
                return Err(ModuleError::InvalidInput(format!(
                    "'{label}' has {} values but '{other}' has {}",
                    a.len(),
                    b.len()
                )));
            }
            row.insert((*other).clone(), minkowski_distance(a, b, p));
        }
        matrix.insert((*label).clone(), row);
        progress(i + 1);
    }
    Ok(matrix)
}
