//! Template-based script backend.

use async_trait::async_trait;

use crate::Result;
use crate::providers::{ImproveRequest, Provider, Script, ScriptProvider, ScriptRequest};

use super::{SIMPLE_PROVIDER_NAME, slug};

/// Script backend built from fixed templates. Output depends only on the
/// request, so regenerating the same topic yields the same script.
#[derive(Debug)]
pub struct SimpleScriptProvider {
    words_per_second: f64,
}

impl SimpleScriptProvider {
    pub fn new(words_per_second: f64) -> Self {
        Self { words_per_second }
    }

    fn target_words(&self, target_duration_secs: u32) -> usize {
        (target_duration_secs as f64 * self.words_per_second).round() as usize
    }
}

impl Provider for SimpleScriptProvider {
    fn name(&self) -> &str {
        SIMPLE_PROVIDER_NAME
    }
}

#[async_trait]
impl ScriptProvider for SimpleScriptProvider {
    async fn generate(&self, request: &ScriptRequest) -> Result<Script> {
        let topic = request.topic.trim();
        let title = format!("{}: what most people get wrong", capitalize(topic));
        let hook = format!("Most people get {topic} completely wrong. Here's why.");
        let call_to_action = format!("Follow for more {} in under a minute.", request.niche);

        let sentences = [
            format!("First, the part everyone skips: the basics of {topic} are the whole game."),
            format!("Most advice about {topic} jumps straight to tricks, and that's backwards."),
            format!(
                "The fastest way to get better at {topic} is one small rep every single day."
            ),
            format!("A classic mistake with {topic} is rushing before the fundamentals stick."),
            format!("Get this right and {topic} stops being intimidating."),
        ];

        // Fill the body until the whole script reaches the word target.
        let frame_words = word_count(&hook) + word_count(&call_to_action);
        let target = self.target_words(request.target_duration_secs).max(frame_words + 10);
        let mut body = String::new();
        let mut idx = 0usize;
        while frame_words + word_count(&body) < target - 5 {
            if !body.is_empty() {
                body.push(' ');
            }
            body.push_str(&sentences[idx % sentences.len()]);
            idx += 1;
        }

        Ok(Script {
            title,
            hook,
            body,
            call_to_action,
            hashtags: vec![
                "#shorts".to_string(),
                format!("#{}", slug(&request.niche)),
                format!("#{}", slug(topic)),
            ],
        })
    }

    async fn improve(&self, request: &ImproveRequest) -> Result<Script> {
        let mut script = request.script.clone();
        let topic = script
            .hashtags
            .last()
            .map(|h| h.trim_start_matches('#').replace('-', " "))
            .unwrap_or_else(|| "this".to_string());

        for feedback in &request.feedback {
            let feedback = feedback.to_ascii_lowercase();
            if feedback.contains("hook") || feedback.contains("engagement") {
                script.hook = format!(
                    "What if everything you learned about {topic} is wrong? {}",
                    script.hook
                );
            }
            if feedback.contains("call to action") || feedback.contains("cta") {
                script.call_to_action =
                    format!("{} Comment your biggest question below.", script.call_to_action);
            }
            if feedback.contains("readability") || feedback.contains("structure") {
                // Break the body into tighter beats.
                script.body = script.body.replace(", and", ". And").replace("; ", ". ");
            }
        }

        // An improvement pass must visibly change the script even when the
        // feedback matched none of the rules above.
        if script == request.script {
            script.body = format!("{} One more thing: consistency beats intensity.", script.body);
        }

        Ok(script)
    }
}

fn capitalize(input: &str) -> String {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}
