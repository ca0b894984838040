//! Builds the wire activity payload from configuration and activity state.
//!
//! Field-level data-quality problems (bad button URLs, image text without a
//! key) are filtered out here rather than surfaced to the host as errors.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::config::{ButtonConfig, Config};
use figma_presence_protocol::{Activity, Assets, Button, Timestamps};

/// The presence host rejects payloads carrying more than two buttons.
const MAX_BUTTONS: usize = 2;

/// Derives a fresh payload from the configuration and the moment the
/// current active phase began.
pub fn build_activity(config: &Config, since: DateTime<Utc>) -> Activity {
    Activity {
        details: config.details.clone(),
        state: config.state.clone(),
        timestamps: Timestamps::since(since),
        assets: build_assets(config),
        buttons: valid_buttons(&config.buttons),
        instance: false,
    }
}

fn build_assets(config: &Config) -> Option<Assets> {
    let mut assets = Assets::default();
    if let Some(key) = &config.large_image_key {
        assets.large_image = Some(key.clone());
        assets.large_text = config.large_image_text.clone();
    }
    if let Some(key) = &config.small_image_key {
        assets.small_image = Some(key.clone());
        assets.small_text = config.small_image_text.clone();
    }
    if assets.is_empty() {
        None
    } else {
        Some(assets)
    }
}

fn valid_buttons(buttons: &[ButtonConfig]) -> Option<Vec<Button>> {
    let mut valid: Vec<Button> = buttons
        .iter()
        .filter(|button| {
            let ok = is_http_url(&button.url);
            if !ok {
                debug!(label = %button.label, url = %button.url, "Dropping button with invalid URL");
            }
            ok
        })
        .map(|button| Button {
            label: button.label.clone(),
            url: button.url.clone(),
        })
        .collect();
    valid.truncate(MAX_BUTTONS);

    if valid.is_empty() {
        None
    } else {
        Some(valid)
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_buttons(buttons: Vec<ButtonConfig>) -> Config {
        Config {
            buttons,
            ..Config::default()
        }
    }

    fn button(label: &str, url: &str) -> ButtonConfig {
        ButtonConfig {
            label: label.to_string(),
            url: url.to_string(),
        }
    }

    #[test]
    fn invalid_button_url_is_dropped_and_valid_kept() {
        let config = config_with_buttons(vec![
            button("Bad", "ftp://x"),
            button("Good", "https://x"),
        ]);
        let activity = build_activity(&config, Utc::now());

        let buttons = activity.buttons.expect("buttons");
        assert_eq!(buttons.len(), 1);
        assert_eq!(buttons[0].label, "Good");
        assert_eq!(buttons[0].url, "https://x");
    }

    #[test]
    fn all_invalid_buttons_omit_the_field_entirely() {
        let config = config_with_buttons(vec![button("Bad", "ftp://x")]);
        let activity = build_activity(&config, Utc::now());
        assert!(activity.buttons.is_none());

        let value = serde_json::to_value(&activity).unwrap();
        assert!(value.as_object().unwrap().get("buttons").is_none());
    }

    #[test]
    fn buttons_are_capped_at_the_host_limit() {
        let config = config_with_buttons(vec![
            button("One", "https://one"),
            button("Two", "http://two"),
            button("Three", "https://three"),
        ]);
        let activity = build_activity(&config, Utc::now());
        assert_eq!(activity.buttons.unwrap().len(), MAX_BUTTONS);
    }

    #[test]
    fn unconfigured_images_omit_assets() {
        let config = Config {
            large_image_key: None,
            large_image_text: None,
            small_image_key: None,
            small_image_text: None,
            ..Config::default()
        };
        let activity = build_activity(&config, Utc::now());
        assert!(activity.assets.is_none());
    }

    #[test]
    fn image_text_without_a_key_is_ignored() {
        let config = Config {
            large_image_key: None,
            large_image_text: Some("orphaned".to_string()),
            small_image_key: None,
            small_image_text: None,
            ..Config::default()
        };
        let activity = build_activity(&config, Utc::now());
        assert!(activity.assets.is_none());
    }

    #[test]
    fn start_timestamp_reflects_active_since() {
        let since = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let activity = build_activity(&Config::default(), since);
        assert_eq!(activity.timestamps.start, 1_700_000_000_000);
    }
}
