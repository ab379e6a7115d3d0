//! Prompt assembly for the reply generator.

use crate::config::{BotConfig, PromptConfig};
use crate::contacts::ContactProfile;
use crate::error::GenerationError;

use minijinja::{Environment, context};

const DEFAULT_TEMPLATE: &str = r#"[SYSTEM]
{{ system }}
You reply on behalf of {{ bot_name }}.

[CONTACT]
Name: {{ contact.name }}
Relation: {{ contact.relation }}
Language: {{ contact.lang }}
Phone: {{ contact.phone }} (confidential)

[STYLE]
{{ style }}

[AVAILABILITY]
{{ availability }}

[OBJECTIVE]
{{ objective }}
{%- if not meetings_allowed %}
Never propose a meeting or an appointment to this contact.
{%- endif %}

[CONFIDENTIALITY]
- Never disclose the phone number or any personal detail of the contact or the owner.
- Never claim to be the owner in person.
- Answer in the contact's language.

[MESSAGE]
{{ message }}
"#;

/// Render the generator prompt for one incoming message.
pub fn build_prompt(
    config: &BotConfig,
    profile: &ContactProfile,
    body: &str,
) -> Result<String, GenerationError> {
    let prompt = &config.prompt;
    let template = prompt.template.as_deref().unwrap_or(DEFAULT_TEMPLATE);

    let environment = Environment::new();
    environment
        .render_str(
            template,
            context! {
                system => prompt.system,
                bot_name => config.name,
                contact => context! {
                    name => profile.name,
                    relation => profile.relation,
                    lang => profile.lang,
                    phone => profile.phone,
                    tone => profile.tone,
                },
                style => style_for(prompt, &profile.relation),
                availability => prompt.availability,
                objective => prompt.objective,
                meetings_allowed => profile.relation != config.contact_defaults.relation,
                message => body,
            },
        )
        .map_err(|error| GenerationError::Prompt(error.to_string()))
}

fn style_for<'a>(prompt: &'a PromptConfig, relation: &str) -> &'a str {
    let friendly = prompt
        .friendly_relations
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(relation));
    if friendly {
        &prompt.friendly_style
    } else {
        &prompt.formal_style
    }
}
