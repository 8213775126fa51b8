//! Operator decisions for scraped results when auto-apply is off.

use std::io::{BufRead, Write};

use async_trait::async_trait;
use log::warn;

use crate::model::{Provider, Scene, ScrapedScene};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDecision {
    Apply,
    Skip,
    Cancel,
}

impl ApplyDecision {
    /// Parses an operator answer; anything unrecognised means skip.
    pub fn from_answer(answer: &str) -> Self {
        match answer.trim().to_ascii_lowercase().as_str() {
            "a" | "apply" | "y" | "yes" => Self::Apply,
            "c" | "cancel" | "q" | "quit" => Self::Cancel,
            _ => Self::Skip,
        }
    }
}

#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    async fn decide(
        &self,
        scene: &Scene,
        provider: Provider,
        scraped: &ScrapedScene,
        score: u8,
    ) -> ApplyDecision;
}

/// Approves every result.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

#[async_trait]
impl OperatorPrompt for AutoApprove {
    async fn decide(&self, _: &Scene, _: Provider, _: &ScrapedScene, _: u8) -> ApplyDecision {
        ApplyDecision::Apply
    }
}

/// Asks on the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdinPrompt;

fn describe(scene: &Scene, provider: Provider, scraped: &ScrapedScene, score: u8) -> String {
    format!(
        "{} match for scene {} ({:?}): title={:?}, date={:?}, studio={:?}, {} performers, {} tags, score {}",
        provider,
        scene.id,
        scene.title,
        scraped.title.as_deref().unwrap_or(""),
        scraped.date.as_deref().unwrap_or(""),
        scraped
            .studio
            .as_ref()
            .map(|studio| studio.name.as_str())
            .unwrap_or(""),
        scraped.performers.len(),
        scraped.tags.len(),
        score
    )
}

#[async_trait]
impl OperatorPrompt for StdinPrompt {
    async fn decide(
        &self,
        scene: &Scene,
        provider: Provider,
        scraped: &ScrapedScene,
        score: u8,
    ) -> ApplyDecision {
        let question = describe(scene, provider, scraped, score);
        let answer = tokio::task::spawn_blocking(move || {
            let mut stdout = std::io::stdout();
            let _ = writeln!(stdout, "{question}");
            let _ = write!(stdout, "[a]pply / [s]kip / [c]ancel? ");
            let _ = stdout.flush();
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line).map(|_| line)
        })
        .await;
        match answer {
            Ok(Ok(line)) => ApplyDecision::from_answer(&line),
            Ok(Err(err)) => {
                warn!("Prompt: failed to read answer, skipping: {}", err);
                ApplyDecision::Skip
            }
            Err(err) => {
                warn!("Prompt: worker failed, skipping: {}", err);
                ApplyDecision::Skip
            }
        }
    }
}
