use serde_json::Value;

use super::GenerationInput;

const FIRST_MESSAGE_PREAMBLE: &str = "Create a new React Native app with Expo from the description below. \
Work in the existing project, keep the Expo dev server running and make sure the app builds.";

pub fn build_prompt(input: &GenerationInput, preview_url: &str) -> String {
    let mut sections = Vec::new();

    if input.is_first_message {
        sections.push(FIRST_MESSAGE_PREAMBLE.to_string());
    }
    sections.push(format!("The app preview is served at {preview_url}."));

    if input.file_edition {
        if let Some(file) = &input.edited_file {
            sections.push(format!("The user is editing {file}. Limit changes to that file where possible."));
        }
        if let Some(selection) = input.selection_data.as_ref().filter(|value| !value.is_null()) {
            sections.push(format!(
                "The user selected this element in the preview. Apply the request to it:\n```json\n{}\n```",
                pretty(selection)
            ));
        }
    }

    if !input.images.is_empty() {
        let mut lines = vec!["Attached images:".to_string()];
        for (index, image) in input.images.iter().enumerate() {
            lines.push(format!("- {}", describe_image(index, image)));
        }
        sections.push(lines.join("\n"));
    }

    sections.push(format!("User request:\n{}", input.user_message.trim()));
    sections.join("\n\n")
}

fn describe_image(index: usize, image: &str) -> String {
    if image.starts_with("data:") {
        let media_type = image
            .trim_start_matches("data:")
            .split([';', ','])
            .next()
            .filter(|value| !value.is_empty())
            .unwrap_or("image");
        format!("image {} ({media_type}, inline, {} bytes)", index + 1, image.len())
    } else {
        format!("image {}: {image}", index + 1)
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
