use std::{
    collections::HashMap,
    fmt::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use tract_onnx::prelude::*;

use crate::anchors::{AnchorPoint, anchors_to_tensor};

type RunnableModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Plans compiled for distinct input shapes are kept up to this many entries.
const MAX_CACHED_PLANS: usize = 8;

/// Raw network output for one image.
///
/// `scores` is `[N, C]` (or `[1, N, C]`) with class 1 the foreground; `points` is `[N, 2]`
/// (or `[1, N, 2]`) holding predicted `(x, y)` in padded-input pixels. Row `i` belongs to anchor `i`.
#[derive(Debug, Clone)]
pub struct RawPredictions {
    pub scores: Tensor,
    pub points: Tensor,
}

/// Capability boundary between the pipeline and whatever executes the network.
pub trait InferenceBackend: Send + Sync + std::fmt::Debug {
    /// Run the network on a `[1, 3, H, W]` input with the anchors generated for that `W x H`.
    fn infer(&self, image: Tensor, anchors: &[AnchorPoint]) -> Result<RawPredictions>;
}

/// Location of the model artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSource {
    /// ONNX graph.
    pub graph: PathBuf,
    /// External weight data referenced by the graph, when stored separately.
    ///
    /// Only checked at load time: it must exist and sit beside `graph`. tract resolves
    /// external data from the locations recorded inside the ONNX file, so this path does
    /// not choose which blob is read.
    pub weights: Option<PathBuf>,
}

impl ModelSource {
    pub fn new<P: Into<PathBuf>>(graph: P) -> Self {
        Self {
            graph: graph.into(),
            weights: None,
        }
    }

    pub fn with_weights<P: Into<PathBuf>>(mut self, weights: P) -> Self {
        self.weights = Some(weights.into());
        self
    }
}

impl From<&p2pnet_utils::config::ModelSettings> for ModelSource {
    fn from(settings: &p2pnet_utils::config::ModelSettings) -> Self {
        Self {
            graph: PathBuf::from(&settings.graph_path),
            weights: settings.weights_path.as_ref().map(PathBuf::from),
        }
    }
}

/// P2PNet ONNX graph executed with tract.
///
/// The graph is parsed once; a runnable plan is specialised and cached for each padded input
/// shape it sees, since the short side of the input varies with the source aspect ratio.
pub struct P2PNetModel {
    graph: InferenceModel,
    path: PathBuf,
    anchor_input: Option<usize>,
    scores_output: usize,
    points_output: usize,
    plans: Mutex<HashMap<(usize, usize, usize), Arc<RunnableModel>>>,
}

impl std::fmt::Debug for P2PNetModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2PNetModel")
            .field("path", &self.path)
            .field("anchor_input", &self.anchor_input)
            .field("scores_output", &self.scores_output)
            .field("points_output", &self.points_output)
            .finish()
    }
}

impl P2PNetModel {
    /// Parse the P2PNet graph and check its input/output signature.
    pub fn load(source: &ModelSource) -> Result<Self> {
        let path = source.graph.as_path();
        anyhow::ensure!(path.exists(), "model file not found: {}", path.display());
        if let Some(weights) = &source.weights {
            anyhow::ensure!(weights.exists(), "model weights not found: {}", weights.display());
            anyhow::ensure!(
                same_directory(path, weights),
                "model weights {} must sit beside the graph {}",
                weights.display(),
                path.display()
            );
            debug!("P2PNet external weights at {}", weights.display());
        }

        let graph = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("failed to parse ONNX graph from {}", path.display()))?;

        let input_count = graph.input_outlets()?.len();
        anyhow::ensure!(
            input_count == 1 || input_count == 2,
            "P2PNet graph must take 1 or 2 inputs (image, anchors), found {input_count}"
        );
        let anchor_input = if input_count == 2 {
            Some(resolve_anchor_input(&graph)?)
        } else {
            None
        };

        let output_count = graph.output_outlets()?.len();
        anyhow::ensure!(
            output_count == 2,
            "P2PNet graph must produce 2 outputs (scores, points), found {output_count}"
        );
        let (scores_output, points_output) = resolve_output_order(&graph)?;

        debug!(
            "P2PNet model {} parsed ({} inputs, scores output #{}, points output #{})",
            path.display(),
            input_count,
            scores_output,
            points_output
        );

        Ok(Self {
            graph,
            path: path.to_path_buf(),
            anchor_input,
            scores_output,
            points_output,
            plans: Mutex::new(HashMap::new()),
        })
    }

    /// Whether the graph consumes the anchor tensor as its second input.
    pub fn takes_anchors(&self) -> bool {
        self.anchor_input.is_some()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn plan_for(&self, height: usize, width: usize, anchors: usize) -> Result<Arc<RunnableModel>> {
        let key = (height, width, anchors);
        {
            let plans = self
                .plans
                .lock()
                .map_err(|_| anyhow::anyhow!("P2PNet plan cache poisoned"))?;
            if let Some(plan) = plans.get(&key) {
                return Ok(Arc::clone(plan));
            }
        }

        let plan = Arc::new(self.compile(height, width, anchors)?);
        let mut plans = self
            .plans
            .lock()
            .map_err(|_| anyhow::anyhow!("P2PNet plan cache poisoned"))?;
        if plans.len() >= MAX_CACHED_PLANS {
            plans.clear();
        }
        plans.insert(key, Arc::clone(&plan));
        Ok(plan)
    }

    fn compile(&self, height: usize, width: usize, anchors: usize) -> Result<RunnableModel> {
        match self.load_runnable_model(height, width, anchors, true) {
            Ok(model) => {
                debug!(
                    "P2PNet model {} optimized successfully ({}x{})",
                    self.path.display(),
                    width,
                    height
                );
                Ok(model)
            }
            Err(opt_err) => {
                let optimize_msg = format!("{opt_err}");
                let mut chain_msg = String::new();
                for cause in opt_err.chain() {
                    let _ = writeln!(&mut chain_msg, "  - {cause}");
                }
                warn!(
                    "P2PNet model {} failed optimized load ({}); falling back to decluttered graph.\nError chain:\n{}",
                    self.path.display(),
                    optimize_msg,
                    chain_msg.trim_end()
                );
                let decluttered = self
                    .load_runnable_model(height, width, anchors, false)
                    .with_context(|| {
                        format!(
                            "fallback to decluttered P2PNet graph failed after optimize error: {optimize_msg}"
                        )
                    })?;
                debug!(
                    "P2PNet model {} running in decluttered mode ({}x{})",
                    self.path.display(),
                    width,
                    height
                );
                Ok(decluttered)
            }
        }
    }

    fn load_runnable_model(
        &self,
        height: usize,
        width: usize,
        anchors: usize,
        optimized: bool,
    ) -> Result<RunnableModel> {
        let image_input = match self.anchor_input {
            Some(0) => 1,
            _ => 0,
        };
        let mut model = self
            .graph
            .clone()
            .with_input_fact(image_input, f32::fact([1, 3, height, width]).into())
            .map_err(|e| anyhow::anyhow!("unable to fix P2PNet input shape: {e}"))?;
        if let Some(index) = self.anchor_input {
            model = model
                .with_input_fact(index, f32::fact([anchors, 2]).into())
                .map_err(|e| anyhow::anyhow!("unable to fix P2PNet anchor shape: {e}"))?;
        }

        if optimized {
            model
                .into_optimized()
                .map_err(|e| anyhow::anyhow!("unable to optimize P2PNet graph: {e}"))?
                .into_runnable()
                .map_err(|e| anyhow::anyhow!("unable to make P2PNet graph runnable: {e}"))
        } else {
            model
                .into_typed()
                .map_err(|e| anyhow::anyhow!("unable to type-check P2PNet graph: {e}"))?
                .into_decluttered()
                .map_err(|e| anyhow::anyhow!("unable to declutter P2PNet graph: {e}"))?
                .into_runnable()
                .map_err(|e| anyhow::anyhow!("unable to make P2PNet graph runnable: {e}"))
        }
    }
}

impl InferenceBackend for P2PNetModel {
    fn infer(&self, image: Tensor, anchors: &[AnchorPoint]) -> Result<RawPredictions> {
        let shape = image.shape().to_vec();
        anyhow::ensure!(
            shape.len() == 4 && shape[0] == 1 && shape[1] == 3,
            "P2PNet expects a [1, 3, H, W] input, got {shape:?}"
        );
        let plan = self.plan_for(shape[2], shape[3], anchors.len())?;

        let inputs: TVec<TValue> = match self.anchor_input {
            Some(index) => {
                let anchor_tensor = anchors_to_tensor(anchors)?;
                if index == 0 {
                    tvec![anchor_tensor.into(), image.into()]
                } else {
                    tvec![image.into(), anchor_tensor.into()]
                }
            }
            None => tvec![image.into()],
        };

        let outputs = plan
            .run(inputs)
            .map_err(|e| anyhow::anyhow!("P2PNet execution failed: {e}"))?;
        anyhow::ensure!(
            outputs.len() == 2,
            "P2PNet produced {} outputs, expected 2",
            outputs.len()
        );

        let mut tensors: Vec<Option<Tensor>> = outputs
            .into_iter()
            .map(|value| Some(value.into_tensor()))
            .collect();
        let scores = tensors[self.scores_output]
            .take()
            .ok_or_else(|| anyhow::anyhow!("P2PNet scores output missing"))?;
        let points = tensors[self.points_output]
            .take()
            .ok_or_else(|| anyhow::anyhow!("P2PNet points output missing"))?;

        Ok(RawPredictions { scores, points })
    }
}

fn same_directory(graph: &Path, weights: &Path) -> bool {
    let dir = |p: &Path| {
        p.canonicalize()
            .ok()
            .and_then(|full| full.parent().map(Path::to_path_buf))
    };
    dir(graph) == dir(weights)
}

/// Pick the anchor input by node name, defaulting to the second input.
fn resolve_anchor_input(graph: &InferenceModel) -> Result<usize> {
    let outlets = graph.input_outlets()?;
    let by_name = outlets
        .iter()
        .position(|outlet| graph.node(outlet.node).name.contains("anchor"));
    Ok(by_name.unwrap_or(1))
}

/// Pick `(scores, points)` output indices from their labels, defaulting to declaration order.
fn resolve_output_order(graph: &InferenceModel) -> Result<(usize, usize)> {
    let outlets = graph.output_outlets()?;
    let label_of = |index: usize| -> String {
        let outlet = outlets[index];
        graph
            .outlet_label(outlet)
            .map(str::to_string)
            .unwrap_or_else(|| graph.node(outlet.node).name.clone())
    };
    if label_of(0).contains("point") || label_of(1).contains("score") {
        Ok((1, 0))
    } else {
        Ok((0, 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loading_missing_model_fails() {
        let result = P2PNetModel::load(&ModelSource::new("missing.onnx"));
        let err = result.expect_err("missing model");
        assert!(format!("{err}").contains("model file not found"));
    }

    #[test]
    fn missing_weights_fail_before_parsing() {
        let temp = NamedTempFile::new().expect("temp file");
        let source = ModelSource::new(temp.path()).with_weights("missing.bin");
        let err = P2PNetModel::load(&source).expect_err("missing weights");
        assert!(format!("{err}").contains("model weights not found"));
    }

    #[test]
    fn weights_outside_graph_directory_are_rejected() {
        let graph_dir = tempfile::tempdir().expect("graph dir");
        let weights_dir = tempfile::tempdir().expect("weights dir");
        let graph = graph_dir.path().join("p2pnet.onnx");
        let weights = weights_dir.path().join("p2pnet.bin");
        std::fs::write(&graph, b"graph").expect("write graph");
        std::fs::write(&weights, b"weights").expect("write weights");

        let err = P2PNetModel::load(&ModelSource::new(&graph).with_weights(&weights))
            .expect_err("weights elsewhere");
        assert!(format!("{err}").contains("must sit beside the graph"));
    }

    #[test]
    fn invalid_model_produces_useful_error() {
        let mut temp = NamedTempFile::new().expect("temp file");
        temp.write_all(b"not a real onnx file")
            .expect("write mock model");

        let err = P2PNetModel::load(&ModelSource::new(temp.path()))
            .expect_err("invalid ONNX should fail");
        let message = format!("{err}");
        assert!(
            message.contains("failed to parse ONNX"),
            "Unexpected error message: {message}"
        );
    }

    #[test]
    fn model_source_from_settings() {
        let settings = p2pnet_utils::config::ModelSettings {
            graph_path: "a.onnx".into(),
            weights_path: Some("a.bin".into()),
        };
        let source = ModelSource::from(&settings);
        assert_eq!(source.graph, PathBuf::from("a.onnx"));
        assert_eq!(source.weights, Some(PathBuf::from("a.bin")));
    }
}
