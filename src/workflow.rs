use std::collections::BTreeMap;

use rand::Rng;
use serde::Serialize;

use crate::checkpoint::default_dimensions;

/// Node id of the save node in the fixed txt2img topology. The poll loop
/// watches this node's outputs for completed artifacts.
pub const SAVE_NODE_ID: &str = "7";

/// Reference to another node's output: `(node id, output slot index)`.
/// Serializes to the backend's `["1", 0]` wire form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeRef(pub String, pub u32);

impl NodeRef {
    pub fn new(node: impl Into<String>, slot: u32) -> Self {
        Self(node.into(), slot)
    }

    pub fn node(&self) -> &str {
        &self.0
    }
}

/// One typed unit of work in a job graph. Serializes to the backend's
/// `{"class_type": ..., "inputs": {...}}` node descriptor.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "class_type", content = "inputs")]
pub enum WorkflowNode {
    #[serde(rename = "CheckpointLoaderSimple")]
    CheckpointLoad { ckpt_name: String },
    #[serde(rename = "CLIPTextEncode")]
    TextEncode { text: String, clip: NodeRef },
    #[serde(rename = "EmptyLatentImage")]
    EmptyLatent {
        width: u32,
        height: u32,
        batch_size: u32,
    },
    #[serde(rename = "KSampler")]
    Sampler {
        seed: i64,
        steps: u32,
        cfg: f64,
        sampler_name: String,
        scheduler: String,
        denoise: f64,
        model: NodeRef,
        positive: NodeRef,
        negative: NodeRef,
        latent_image: NodeRef,
    },
    #[serde(rename = "VAEDecode")]
    Decode { samples: NodeRef, vae: NodeRef },
    #[serde(rename = "SaveImage")]
    Save {
        images: NodeRef,
        filename_prefix: String,
    },
}

impl WorkflowNode {
    /// All node references carried by this node's inputs.
    fn refs(&self) -> Vec<&NodeRef> {
        match self {
            WorkflowNode::CheckpointLoad { .. } | WorkflowNode::EmptyLatent { .. } => Vec::new(),
            WorkflowNode::TextEncode { clip, .. } => vec![clip],
            WorkflowNode::Sampler {
                model,
                positive,
                negative,
                latent_image,
                ..
            } => vec![model, positive, negative, latent_image],
            WorkflowNode::Decode { samples, vae } => vec![samples, vae],
            WorkflowNode::Save { images, .. } => vec![images],
        }
    }
}

/// A job graph: node id to typed node descriptor. Built fresh per request
/// and never mutated after submission.
#[derive(Debug, Clone, Serialize)]
#[serde(transparent)]
pub struct WorkflowGraph {
    nodes: BTreeMap<String, WorkflowNode>,
}

impl WorkflowGraph {
    pub fn get(&self, id: &str) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Check that every node reference resolves to a node present in the
    /// graph. Returns the first dangling reference found.
    pub fn validate(&self) -> std::result::Result<(), String> {
        for (id, node) in &self.nodes {
            for node_ref in node.refs() {
                if !self.nodes.contains_key(node_ref.node()) {
                    return Err(format!(
                        "node {} references missing node {}",
                        id,
                        node_ref.node()
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Parameters for one txt2img generation, consumed by [`build`](Self::build).
///
/// # Example
/// ```
/// use sd_provider::GenerationRequest;
///
/// let (workflow, seed) =
///     GenerationRequest::new("a cat in space", "dreamshaper_8.safetensors")
///         .negative("lowres, blurry")
///         .size(512, 768)
///         .steps(25)
///         .build();
///
/// assert!(seed >= 0);
/// assert!(workflow.get("1").is_some());
/// ```
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub checkpoint: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    pub sampler: String,
    pub scheduler: String,
    pub denoise: f64,
    pub seed: Option<i64>,
    pub batch_size: u32,
    pub filename_prefix: String,
}

impl GenerationRequest {
    /// Create a request with a prompt and checkpoint filename. Dimensions
    /// default by size class (XL checkpoints 1024x1024, otherwise 512x512);
    /// everything else uses the backend's conventional defaults.
    pub fn new(prompt: impl Into<String>, checkpoint: impl Into<String>) -> Self {
        let checkpoint = checkpoint.into();
        let (width, height) = default_dimensions(&checkpoint);
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            checkpoint,
            width,
            height,
            steps: 20,
            cfg_scale: 7.0,
            sampler: "euler".to_string(),
            scheduler: "normal".to_string(),
            denoise: 1.0,
            seed: None,
            batch_size: 1,
            filename_prefix: "ComfyUI".to_string(),
        }
    }

    /// Set the negative prompt.
    pub fn negative(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = prompt.into();
        self
    }

    /// Set output dimensions, overriding the size-class default.
    pub fn size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the number of sampling steps.
    pub fn steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    /// Set the classifier-free guidance scale.
    pub fn cfg_scale(mut self, cfg: f64) -> Self {
        self.cfg_scale = cfg;
        self
    }

    /// Set the sampler algorithm (e.g. "euler", "dpmpp_2m").
    pub fn sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = sampler.into();
        self
    }

    /// Set the noise scheduler (e.g. "normal", "karras").
    pub fn scheduler(mut self, scheduler: impl Into<String>) -> Self {
        self.scheduler = scheduler.into();
        self
    }

    /// Set the denoising strength (0.0-1.0).
    pub fn denoise(mut self, denoise: f64) -> Self {
        self.denoise = denoise;
        self
    }

    /// Set a specific seed. Unset requests use a random seed.
    pub fn seed(mut self, seed: i64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Set the batch size (number of images per generation).
    pub fn batch_size(mut self, size: u32) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the output filename prefix on the backend.
    pub fn filename_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.filename_prefix = prefix.into();
        self
    }

    /// Build the fixed 7-node txt2img graph and resolve the seed.
    ///
    /// Topology: checkpoint-load "1" feeds the two CLIP encoders "2"/"3"
    /// and the sampler "4"; the empty latent "5" feeds the sampler; decode
    /// "6" and save "7" finish the chain. Returns `(graph, actual_seed)` so
    /// a randomly drawn seed can be stored with the result.
    pub fn build(&self) -> (WorkflowGraph, i64) {
        let seed = self
            .seed
            .unwrap_or_else(|| rand::rng().random_range(0..i64::MAX));

        let mut nodes = BTreeMap::new();
        nodes.insert(
            "1".to_string(),
            WorkflowNode::CheckpointLoad {
                ckpt_name: self.checkpoint.clone(),
            },
        );
        nodes.insert(
            "2".to_string(),
            WorkflowNode::TextEncode {
                text: self.prompt.clone(),
                clip: NodeRef::new("1", 1),
            },
        );
        nodes.insert(
            "3".to_string(),
            WorkflowNode::TextEncode {
                text: self.negative_prompt.clone(),
                clip: NodeRef::new("1", 1),
            },
        );
        nodes.insert(
            "4".to_string(),
            WorkflowNode::Sampler {
                seed,
                steps: self.steps,
                cfg: self.cfg_scale,
                sampler_name: self.sampler.clone(),
                scheduler: self.scheduler.clone(),
                denoise: self.denoise,
                model: NodeRef::new("1", 0),
                positive: NodeRef::new("2", 0),
                negative: NodeRef::new("3", 0),
                latent_image: NodeRef::new("5", 0),
            },
        );
        nodes.insert(
            "5".to_string(),
            WorkflowNode::EmptyLatent {
                width: self.width,
                height: self.height,
                batch_size: self.batch_size,
            },
        );
        nodes.insert(
            "6".to_string(),
            WorkflowNode::Decode {
                samples: NodeRef::new("4", 0),
                vae: NodeRef::new("1", 2),
            },
        );
        nodes.insert(
            SAVE_NODE_ID.to_string(),
            WorkflowNode::Save {
                images: NodeRef::new("6", 0),
                filename_prefix: self.filename_prefix.clone(),
            },
        );

        let graph = WorkflowGraph { nodes };
        debug_assert!(graph.validate().is_ok());
        (graph, seed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn make_request() -> GenerationRequest {
        GenerationRequest::new("masterpiece, best quality, a cat", "dreamshaper_8.safetensors")
            .negative("lowres, blurry")
            .size(512, 768)
            .steps(25)
            .cfg_scale(7.5)
            .sampler("dpmpp_2m")
            .scheduler("karras")
            .seed(12345)
    }

    fn to_json(graph: &WorkflowGraph) -> Value {
        serde_json::to_value(graph).unwrap()
    }

    #[test]
    fn test_build_has_all_nodes() {
        let (workflow, _) = make_request().build();
        assert_eq!(workflow.len(), 7);
        for i in 1..=7 {
            assert!(workflow.get(&i.to_string()).is_some(), "Missing node {}", i);
        }
    }

    #[test]
    fn test_graph_validates() {
        let (workflow, _) = make_request().build();
        assert!(workflow.validate().is_ok());
    }

    #[test]
    fn test_dangling_reference_rejected() {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "1".to_string(),
            WorkflowNode::TextEncode {
                text: "test".to_string(),
                clip: NodeRef::new("99", 1),
            },
        );
        let graph = WorkflowGraph { nodes };
        let err = graph.validate().unwrap_err();
        assert!(err.contains("99"));
    }

    #[test]
    fn test_wire_shape() {
        let (workflow, _) = make_request().build();
        let json = to_json(&workflow);
        assert_eq!(json["1"]["class_type"], "CheckpointLoaderSimple");
        assert_eq!(json["1"]["inputs"]["ckpt_name"], "dreamshaper_8.safetensors");
        assert_eq!(json["7"]["class_type"], "SaveImage");
    }

    #[test]
    fn test_sampler_settings() {
        let (workflow, seed) = make_request().build();
        let json = to_json(&workflow);
        let node = &json["4"];
        assert_eq!(node["class_type"], "KSampler");
        assert_eq!(node["inputs"]["seed"], 12345);
        assert_eq!(seed, 12345);
        assert_eq!(node["inputs"]["steps"], 25);
        assert_eq!(node["inputs"]["cfg"], 7.5);
        assert_eq!(node["inputs"]["sampler_name"], "dpmpp_2m");
        assert_eq!(node["inputs"]["scheduler"], "karras");
        assert_eq!(node["inputs"]["denoise"], 1.0);
    }

    #[test]
    fn test_random_seed_when_unset() {
        let (workflow, seed) = GenerationRequest::new("test", "ckpt.safetensors").build();
        assert!(seed >= 0);
        let json = to_json(&workflow);
        assert_eq!(json["4"]["inputs"]["seed"], seed);
    }

    #[test]
    fn test_clip_text_encode() {
        let (workflow, _) = make_request().build();
        let json = to_json(&workflow);
        assert_eq!(json["2"]["inputs"]["text"], "masterpiece, best quality, a cat");
        assert_eq!(json["2"]["inputs"]["clip"], json!(["1", 1]));
        assert_eq!(json["3"]["inputs"]["text"], "lowres, blurry");
    }

    #[test]
    fn test_empty_latent_batch_size() {
        let (workflow, _) = make_request().batch_size(3).build();
        let json = to_json(&workflow);
        assert_eq!(json["5"]["inputs"]["width"], 512);
        assert_eq!(json["5"]["inputs"]["height"], 768);
        assert_eq!(json["5"]["inputs"]["batch_size"], 3);
    }

    #[test]
    fn test_node_connections() {
        let (workflow, _) = make_request().build();
        let json = to_json(&workflow);
        assert_eq!(json["4"]["inputs"]["model"], json!(["1", 0]));
        assert_eq!(json["4"]["inputs"]["positive"], json!(["2", 0]));
        assert_eq!(json["4"]["inputs"]["negative"], json!(["3", 0]));
        assert_eq!(json["4"]["inputs"]["latent_image"], json!(["5", 0]));
        assert_eq!(json["6"]["inputs"]["samples"], json!(["4", 0]));
        assert_eq!(json["6"]["inputs"]["vae"], json!(["1", 2]));
        assert_eq!(json["7"]["inputs"]["images"], json!(["6", 0]));
    }

    #[test]
    fn test_xl_checkpoint_dimension_defaults() {
        let req = GenerationRequest::new("test", "sdxl_base.safetensors");
        assert_eq!((req.width, req.height), (1024, 1024));

        let req = GenerationRequest::new("test", "dreamshaper_8.safetensors");
        assert_eq!((req.width, req.height), (512, 512));
    }

    #[test]
    fn test_explicit_size_overrides_size_class() {
        let req = GenerationRequest::new("test", "sdxl_base.safetensors").size(768, 768);
        assert_eq!((req.width, req.height), (768, 768));
    }

    #[test]
    fn test_defaults() {
        let req = GenerationRequest::new("test prompt", "model.safetensors");
        assert_eq!(req.steps, 20);
        assert_eq!(req.cfg_scale, 7.0);
        assert_eq!(req.sampler, "euler");
        assert_eq!(req.scheduler, "normal");
        assert_eq!(req.denoise, 1.0);
        assert_eq!(req.seed, None);
        assert_eq!(req.batch_size, 1);
        assert_eq!(req.filename_prefix, "ComfyUI");
        assert!(req.negative_prompt.is_empty());
    }

    #[test]
    fn test_custom_filename_prefix() {
        let (workflow, _) = make_request().filename_prefix("MyProject").build();
        let json = to_json(&workflow);
        assert_eq!(json["7"]["inputs"]["filename_prefix"], "MyProject");
    }

    #[test]
    fn test_workflow_roundtrip() {
        let (workflow, _) = make_request().build();
        let json_str = serde_json::to_string(&workflow).unwrap();
        let _: Value = serde_json::from_str(&json_str).unwrap();
    }
}
