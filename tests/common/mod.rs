#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use docrag::{EmbeddingBackend, RelevanceScorer, Result};

pub const DIMENSION: usize = 64;

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() >= 3)
        .map(str::to_lowercase)
}

/// Bag-of-words embeddings: each word hashes into one of [`DIMENSION`]
/// buckets and the vector is normalized to unit length.
#[derive(Default)]
pub struct HashingEmbedder {
    pub calls: AtomicUsize,
}

impl HashingEmbedder {
    pub fn embed(text: &str) -> Option<Vec<f32>> {
        let mut vector = vec![0.0f32; DIMENSION];
        for word in words(text) {
            let bucket = blake3::hash(word.as_bytes()).as_bytes()[0] as usize % DIMENSION;
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm == 0.0 {
            return None;
        }
        Some(vector.into_iter().map(|x| x / norm).collect())
    }
}

#[async_trait]
impl EmbeddingBackend for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    fn dimension(&self) -> usize {
        DIMENSION
    }

    fn max_batch_size(&self) -> usize {
        8
    }

    async fn generate_embedding(&self, text: &str) -> Option<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Self::embed(text)
    }
}

/// Scores the share of question words found in the document, out of 10,
/// answering in a chatty format.
#[derive(Default)]
pub struct OverlapScorer {
    pub calls: AtomicUsize,
}

#[async_trait]
impl RelevanceScorer for OverlapScorer {
    fn name(&self) -> &str {
        "overlap"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let question = between(prompt, "Question: ", "\n\n");
        let document = between(prompt, "Document: ", "\n\nRate from");

        let doc_words: Vec<String> = words(document).collect();
        let asked: Vec<String> = words(question).collect();
        if asked.is_empty() {
            return Ok("0".into());
        }
        let hits = asked.iter().filter(|w| doc_words.contains(w)).count();
        let score = 10.0 * hits as f32 / asked.len() as f32;
        Ok(format!("Relevance: {score:.1}"))
    }
}

fn between<'a>(text: &'a str, start: &str, end: &str) -> &'a str {
    let Some(from) = text.find(start).map(|i| i + start.len()) else {
        return "";
    };
    let rest = &text[from..];
    rest.find(end).map_or(rest, |to| &rest[..to])
}
