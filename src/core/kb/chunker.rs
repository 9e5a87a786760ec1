use anyhow::Result;

use crate::core::llm::LlmClient;

pub const MAX_CHUNK_SIZE: usize = 1000;
pub const SIMILARITY_THRESHOLD: f32 = 0.5;

#[derive(Debug, Clone, Copy)]
pub struct ChunkerConfig {
    pub max_chunk_size: usize,
    pub similarity_threshold: f32,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_chunk_size: MAX_CHUNK_SIZE,
            similarity_threshold: SIMILARITY_THRESHOLD,
        }
    }
}

/// A chunk of sentences sharing a topic. `embedding` is the centroid of the
/// member sentences' embeddings.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub text: String,
    pub embedding: Vec<f32>,
}

/// Split on a sentence terminator (`.?!`, possibly repeated) followed by
/// whitespace; empties are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '?' | '!') {
            // Swallow a run of terminators before deciding.
            while matches!(chars.peek(), Some('.') | Some('?') | Some('!')) {
                current.push(chars.next().unwrap());
            }
            if chars.peek().map_or(true, |next| next.is_whitespace()) {
                let sentence = current.trim();
                if !sentence.is_empty() {
                    sentences.push(sentence.to_string());
                }
                current.clear();
            }
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Cosine similarity; zero-norm vectors compare as 0 so a degenerate
/// embedding always forces a split.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// The open chunk's topic, held as (sum, count) so the running mean never
/// accumulates rounding drift.
struct Centroid {
    sum: Vec<f32>,
    count: usize,
}

impl Centroid {
    fn start(embedding: &[f32]) -> Self {
        Self {
            sum: embedding.to_vec(),
            count: 1,
        }
    }

    fn mean(&self) -> Vec<f32> {
        self.sum
            .iter()
            .map(|v| v / self.count as f32)
            .collect()
    }

    fn add(&mut self, embedding: &[f32]) {
        for (slot, v) in self.sum.iter_mut().zip(embedding) {
            *slot += v;
        }
        self.count += 1;
    }
}

/// Split text into topic-coherent chunks. Sentences are embedded in one
/// batch call; a new sentence joins the open chunk unless it would blow the
/// size cap or its similarity to the chunk centroid drops below threshold.
pub async fn semantic_chunks(
    llm: &dyn LlmClient,
    text: &str,
    config: ChunkerConfig,
) -> Result<Vec<Chunk>> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Ok(Vec::new());
    }

    let embeddings = llm.embed(&sentences).await?;

    let mut chunks = Vec::new();
    let mut members = vec![sentences[0].clone()];
    // The size budget counts characters, not bytes.
    let mut size = sentences[0].chars().count();
    let mut centroid = Centroid::start(&embeddings[0]);

    for (sentence, embedding) in sentences.iter().zip(embeddings.iter()).skip(1) {
        let sentence_chars = sentence.chars().count();
        let over_size = size + sentence_chars > config.max_chunk_size;
        let topic_shift = !over_size
            && cosine_similarity(embedding, &centroid.mean()) < config.similarity_threshold;

        if over_size || topic_shift {
            chunks.push(Chunk {
                text: members.join(" "),
                embedding: centroid.mean(),
            });
            members = vec![sentence.clone()];
            size = sentence_chars;
            centroid = Centroid::start(embedding);
        } else {
            members.push(sentence.clone());
            size += sentence_chars;
            centroid.add(embedding);
        }
    }

    chunks.push(Chunk {
        text: members.join(" "),
        embedding: centroid.mean(),
    });
    Ok(chunks)
}
