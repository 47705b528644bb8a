//! Centroid classifier — fast routing via embedding similarity.
//!
//! Each route has a centroid: the L2-normalized mean of its prototype
//! embeddings, persisted as one JSON float array per route. A prompt is
//! embedded and dotted against every centroid; the top scorer is the
//! tentative route and the gap to the runner-up is the confidence. Clear
//! cases terminate here (~50ms); borderline cases fall through to the
//! arbitrator.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use beigebox_vector::Embedder;
use tracing::{debug, error, info, warn};

use crate::types::RouteTable;

/// Result of a centroid classification pass.
#[derive(Debug, Clone, Default)]
pub struct CentroidDecision {
    /// Winning route name ("default" when not ready).
    pub tier: String,
    /// Gap between the top two centroid scores.
    pub confidence: f32,
    /// Resolved model string ("" when not ready).
    pub model: String,
    pub latency_ms: u64,
    /// True when confidence fell below the threshold.
    pub borderline: bool,
}

pub struct CentroidClassifier {
    embedder: Arc<dyn Embedder>,
    centroids: BTreeMap<String, Vec<f32>>,
    routes: RouteTable,
    threshold: f32,
}

impl CentroidClassifier {
    /// Load centroids from a directory of `<route>.json` float arrays.
    pub fn load(
        centroid_dir: &Path,
        embedder: Arc<dyn Embedder>,
        routes: RouteTable,
        threshold: f32,
    ) -> Self {
        let mut centroids = BTreeMap::new();
        if let Ok(entries) = std::fs::read_dir(centroid_dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                let name = stem.trim_end_matches("_centroid").to_string();
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|t| serde_json::from_str::<Vec<f32>>(&t).map_err(|e| e.to_string()))
                {
                    Ok(vector) => {
                        info!(route = %name, dim = vector.len(), "centroid loaded");
                        centroids.insert(name, vector);
                    }
                    Err(e) => warn!(path = %path.display(), err = %e, "skipping bad centroid file"),
                }
            }
        }
        if centroids.is_empty() {
            warn!(
                dir = %centroid_dir.display(),
                "no centroid files found; centroid stage will be skipped"
            );
        }
        Self { embedder, centroids, routes, threshold }
    }

    pub fn ready(&self) -> bool {
        !self.centroids.is_empty()
    }

    /// Classify a prompt against all loaded centroids.
    ///
    /// Exact ties go to the lexicographically smallest route name. A
    /// single centroid scores confidence 1.0. Embedding failures return a
    /// borderline decision so routing falls through.
    pub async fn classify(&self, prompt: &str) -> CentroidDecision {
        if !self.ready() {
            return CentroidDecision { tier: "default".to_string(), borderline: true, ..Default::default() };
        }

        let start = Instant::now();
        let embedding = match self.embedder.embed(prompt).await {
            Ok(v) => v,
            Err(e) => {
                error!(err = %e, "centroid classification embed failed");
                return CentroidDecision {
                    tier: "default".to_string(),
                    borderline: true,
                    ..Default::default()
                };
            }
        };

        // BTreeMap iterates name-ascending; strict greater-than keeps the
        // lexicographically smallest name on exact ties.
        let mut best_route = "";
        let mut best_score = f32::NEG_INFINITY;
        let mut second_score = f32::NEG_INFINITY;
        for (name, centroid) in &self.centroids {
            let score = dot(&embedding, centroid);
            if score > best_score {
                second_score = best_score;
                best_score = score;
                best_route = name;
            } else if score > second_score {
                second_score = score;
            }
        }

        let confidence = if self.centroids.len() > 1 { best_score - second_score } else { 1.0 };
        let latency_ms = start.elapsed().as_millis() as u64;
        let borderline = confidence < self.threshold;
        let model = self.routes.resolve_tier(best_route);

        debug!(
            best = best_route,
            confidence,
            borderline,
            latency_ms,
            "centroid classification"
        );

        CentroidDecision {
            tier: best_route.to_string(),
            confidence,
            model,
            latency_ms,
            borderline,
        }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ── Centroid builder ────────────────────────────────────────────────────

/// Seed prototypes per route, embedded and averaged by `build_centroids`.
pub fn prototype_sets() -> BTreeMap<&'static str, Vec<&'static str>> {
    let mut sets = BTreeMap::new();
    sets.insert(
        "simple",
        vec![
            "What is the capital of France?",
            "Who wrote Romeo and Juliet?",
            "What year did World War II end?",
            "What is 25 times 4?",
            "Define photosynthesis",
            "Translate 'thank you' to Spanish",
            "Is Python a compiled language?",
            "List the days of the week",
            "Hello, how are you?",
            "Tell me a joke",
            "What is the boiling point of water?",
            "What timezone is New York in?",
            "Give me a synonym for 'happy'",
            "What comes after Tuesday?",
            "Read the file config.yaml",
            "Show me the contents of README.md",
            "Run npm install",
            "Check the git status",
            "What does this function do?",
            "How do I create a new branch in git?",
            "Change the port from 3000 to 8080",
            "Fix this typo: 'recieve' should be 'receive'",
            "What version of Python is installed?",
            "How much disk space is available?",
            "What's my IP address?",
            "Convert 5 kilometers to miles",
            "How many sides does a hexagon have?",
            "What is 10% of 250?",
            "Sort these numbers: 5, 2, 8, 1, 9",
            "Reverse the string 'hello'",
            "What's the weather like?",
            "How do I make a cup of tea?",
            "What color is the sky?",
            "Name three primary colors",
            "What is the speed of light?",
            "Who painted the Mona Lisa?",
            "What is the largest planet?",
            "How many continents are there?",
            "What does GDP stand for?",
            "Is 7 a prime number?",
        ],
    );
    sets.insert(
        "complex",
        vec![
            "Design a microservices architecture for a real-time multiplayer game",
            "Architect a distributed event-sourcing system for financial trading",
            "Implement a thread-safe LRU cache in Python with TTL support",
            "Write a complete REST API with authentication and rate limiting",
            "Debug this memory leak in a Node.js WebSocket application",
            "Optimize this SQL query on a table with 50 million rows",
            "Compare transformer architectures GPT-4 vs Claude vs Gemini",
            "Prove that the halting problem is undecidable",
            "Derive the backpropagation algorithm from first principles",
            "Refactor this 2000-line class into domain-driven design",
            "Design a zero-trust security architecture for multi-cloud",
            "Create a CI/CD pipeline with canary releases and rollback",
            "Analyze the trade-offs between consistency and availability",
            "Write a short story exploring AI consciousness and philosophy",
            "Build a comprehensive monitoring system with incident automation",
            "Perform a security audit identifying OWASP Top 10 risks",
            "Design a disaster recovery plan with 15 minute RPO",
            "Compare container orchestration Kubernetes vs Nomad vs ECS",
            "Investigate a race condition in concurrent Go code",
            "Migrate this Express.js app to TypeScript with full type safety",
            "Design a database schema for a social media platform with caching",
            "Explain quantum error correction implications for practical QC",
            "Analyze garbage collection for a latency-sensitive trading system",
            "Create a data strategy for healthcare AI addressing HIPAA",
            "Build a React component library with theming and accessibility",
            "Profile and optimize a Python pipeline processing 10GB CSVs",
            "Implement a B-tree with insert delete search and rebalancing",
            "Design a scalable notification system for push email SMS channels",
            "Review this distributed transaction for race conditions",
            "Evaluate migrating from REST to GraphQL with migration plan",
        ],
    );
    sets.insert(
        "code",
        vec![
            "Write a Python function to parse JSON",
            "Debug this segfault in my C++ code",
            "Implement a REST API endpoint in FastAPI",
            "How do I use async/await in JavaScript?",
            "Write a SQL query to find duplicate rows",
            "Refactor this class to use dependency injection",
            "What's the difference between a list and a tuple?",
            "Write a bash script to backup a directory",
            "How do I set up a virtual environment in Python?",
            "Explain how Git rebase works",
            "Write unit tests for this function",
            "How do I handle exceptions in Python?",
            "What is a Docker volume?",
            "Write a regex to validate an email address",
            "How do I connect to a PostgreSQL database in Python?",
        ],
    );
    sets.insert(
        "creative",
        vec![
            "Write a short story about a lonely robot",
            "Compose a poem about autumn rain",
            "Help me brainstorm names for my startup",
            "Write a product description for noise-canceling headphones",
            "Create a metaphor for explaining machine learning",
            "Write a haiku about debugging code",
            "Help me write a cover letter",
            "Suggest some themes for a sci-fi novel",
            "Write dialogue between two strangers on a train",
            "Create a tagline for a coffee shop",
            "Help me write a toast for a wedding",
            "Describe a sunset in the style of Hemingway",
            "Write a children's story about a brave mouse",
            "Create five names for a fantasy kingdom",
            "Help me write a LinkedIn post about my promotion",
        ],
    );
    sets
}

/// Embed every prototype set, average and L2-normalize, and write one
/// `<route>.json` file per route. Returns the routes written.
pub async fn build_centroids(
    embedder: &dyn Embedder,
    centroid_dir: &Path,
) -> Result<Vec<String>, beigebox_vector::VectorError> {
    std::fs::create_dir_all(centroid_dir)?;
    let mut written = Vec::new();

    for (route, prototypes) in prototype_sets() {
        let texts: Vec<String> = prototypes.iter().map(|s| s.to_string()).collect();
        let embeddings = embedder.embed_batch(&texts).await?;
        if embeddings.is_empty() {
            continue;
        }

        let dim = embeddings[0].len();
        let mut centroid = vec![0.0f32; dim];
        for emb in &embeddings {
            for (c, v) in centroid.iter_mut().zip(emb) {
                *c += v;
            }
        }
        let n = embeddings.len() as f32;
        for c in &mut centroid {
            *c /= n;
        }
        let centroid = beigebox_vector::embedder::l2_normalize(centroid);

        let path = centroid_dir.join(format!("{route}.json"));
        std::fs::write(&path, serde_json::to_string(&centroid)?)?;
        info!(route, dim, path = %path.display(), "centroid saved");
        written.push(route.to_string());
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beigebox_core::config::RouteConfig;
    use beigebox_vector::embedder::l2_normalize;

    /// Embeds to a fixed axis per leading keyword.
    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> beigebox_vector::error::Result<Vec<f32>> {
            let v = match text.split_whitespace().next().unwrap_or("") {
                "simple" => vec![1.0, 0.0, 0.0],
                "complex" => vec![0.0, 1.0, 0.0],
                // Ambiguous: equidistant from both centroids
                "between" => vec![1.0, 1.0, 0.0],
                _ => vec![0.0, 0.0, 1.0],
            };
            Ok(l2_normalize(v))
        }

        async fn embed_batch(&self, texts: &[String]) -> beigebox_vector::error::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }

        fn dimension(&self) -> usize {
            3
        }
    }

    fn routes() -> RouteTable {
        let mut map = std::collections::BTreeMap::new();
        map.insert(
            "fast".to_string(),
            RouteConfig { model: "llama3.2:3b".to_string(), description: String::new() },
        );
        map.insert(
            "large".to_string(),
            RouteConfig { model: "qwen3:30b".to_string(), description: String::new() },
        );
        RouteTable::new(map, "default-model")
    }

    fn write_centroid(dir: &Path, name: &str, v: &[f32]) {
        std::fs::write(dir.join(format!("{name}.json")), serde_json::to_string(v).unwrap())
            .unwrap();
    }

    fn classifier(dir: &Path, threshold: f32) -> CentroidClassifier {
        CentroidClassifier::load(dir, Arc::new(AxisEmbedder), routes(), threshold)
    }

    #[tokio::test]
    async fn clear_prompts_classify_with_confidence() {
        let dir = tempfile::tempdir().unwrap();
        write_centroid(dir.path(), "simple", &[1.0, 0.0, 0.0]);
        write_centroid(dir.path(), "complex", &[0.0, 1.0, 0.0]);

        let c = classifier(dir.path(), 0.04);
        let d = c.classify("simple question here").await;
        assert_eq!(d.tier, "simple");
        assert!(!d.borderline);
        assert_eq!(d.model, "llama3.2:3b"); // simple → fast alias
    }

    #[tokio::test]
    async fn two_centroid_confidence_is_the_score_gap() {
        let dir = tempfile::tempdir().unwrap();
        write_centroid(dir.path(), "simple", &[1.0, 0.0, 0.0]);
        write_centroid(dir.path(), "complex", &[0.0, 1.0, 0.0]);

        let c = classifier(dir.path(), 0.04);
        let d = c.classify("simple question").await;
        // a·v = 1.0, b·v = 0.0 → confidence = |a·v − b·v| = 1.0
        assert!((d.confidence - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn ambiguous_prompts_are_borderline() {
        let dir = tempfile::tempdir().unwrap();
        write_centroid(dir.path(), "simple", &[1.0, 0.0, 0.0]);
        write_centroid(dir.path(), "complex", &[0.0, 1.0, 0.0]);

        let c = classifier(dir.path(), 0.04);
        let d = c.classify("between the two").await;
        assert!(d.borderline);
        assert!(d.confidence < 0.04);
    }

    #[tokio::test]
    async fn exact_ties_pick_the_lexicographically_smallest() {
        let dir = tempfile::tempdir().unwrap();
        // Identical centroids: every prompt ties exactly
        write_centroid(dir.path(), "bravo", &[1.0, 0.0, 0.0]);
        write_centroid(dir.path(), "alpha", &[1.0, 0.0, 0.0]);

        let c = classifier(dir.path(), 2.0); // force borderline either way
        let d = c.classify("simple prompt").await;
        assert_eq!(d.tier, "alpha");
    }

    #[tokio::test]
    async fn no_centroids_means_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let c = classifier(dir.path(), 0.04);
        assert!(!c.ready());
        let d = c.classify("anything").await;
        assert!(d.borderline);
    }

    #[tokio::test]
    async fn build_writes_one_file_per_route() {
        let dir = tempfile::tempdir().unwrap();
        let written = build_centroids(&AxisEmbedder, dir.path()).await.unwrap();
        assert_eq!(written.len(), 4);
        for route in ["simple", "complex", "code", "creative"] {
            let path = dir.path().join(format!("{route}.json"));
            let text = std::fs::read_to_string(path).unwrap();
            let v: Vec<f32> = serde_json::from_str(&text).unwrap();
            assert_eq!(v.len(), 3);
            let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
    }
}
