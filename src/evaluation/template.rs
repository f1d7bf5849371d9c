use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::LazyLock;

const INPUT_TOKEN: &str = "{{input}}";

static EXPECTED_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{\{#expected\}\}(.*?)\{\{/expected\}\}").unwrap());

static CRITERION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{(input|output|expected)\}\}").unwrap());

/// Build the message sent to the target model.
///
/// Every `{{name}}` from `variables` is substituted first. A template that
/// contains `{{input}}` is the whole message; any other template is a prefix
/// and `input` follows it after a blank line. Without a template the message
/// is `input` alone.
pub fn render_prompt(
    template: Option<&str>,
    variables: &BTreeMap<String, String>,
    input: &str,
) -> String {
    let template = match template {
        Some(t) if !t.trim().is_empty() => t,
        _ => return input.to_string(),
    };

    let mut rendered = template.to_string();
    for (name, value) in variables {
        rendered = rendered.replace(&format!("{{{{{}}}}}", name), value);
    }

    if template.contains(INPUT_TOKEN) {
        rendered.replace(INPUT_TOKEN, input)
    } else {
        format!("{}\n\n{}", rendered, input).trim().to_string()
    }
}

/// Build a judge prompt from a criterion template.
///
/// Each `{{#expected}}...{{/expected}}` region is resolved to its inner text
/// when `expected` is present and dropped otherwise. Regions are matched
/// non-greedily left to right and do not nest. The remaining `{{input}}`,
/// `{{output}}` and `{{expected}}` tokens are then substituted in a single
/// pass, so values containing token text are never re-expanded. A missing
/// expected value renders as the empty string.
pub fn render_criterion_prompt(
    template: &str,
    input: &str,
    output: &str,
    expected: Option<&str>,
) -> String {
    let resolved = EXPECTED_BLOCK.replace_all(template, |caps: &Captures<'_>| match expected {
        Some(_) => caps[1].to_string(),
        None => String::new(),
    });

    CRITERION_TOKEN
        .replace_all(&resolved, |caps: &Captures<'_>| match &caps[1] {
            "input" => input.to_string(),
            "output" => output.to_string(),
            _ => expected.unwrap_or_default().to_string(),
        })
        .into_owned()
}
