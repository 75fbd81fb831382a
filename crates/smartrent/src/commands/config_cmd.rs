//! Config subcommand handlers. None of these open a session.

use secrecy::SecretString;

use smartrent_config::{Config, SecretKind};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

const MASK: &str = "****";

/// Copy of the config with plaintext secrets masked.
fn redacted(cfg: &Config) -> Config {
    let mut cfg = cfg.clone();
    for profile in cfg.profiles.values_mut() {
        if profile.password.is_some() {
            profile.password = Some(MASK.into());
        }
        if profile.tfa_secret.is_some() {
            profile.tfa_secret = Some(MASK.into());
        }
    }
    cfg
}

fn keyring_notes(cfg: &Config) -> Vec<String> {
    let mut names: Vec<&String> = cfg.profiles.keys().collect();
    names.sort();
    let mut notes = Vec::new();
    for name in names {
        if smartrent_config::has_stored_secret(SecretKind::Password, name) {
            notes.push(format!("# {name}: password stored in keyring"));
        }
        if smartrent_config::has_stored_secret(SecretKind::TfaSecret, name) {
            notes.push(format!("# {name}: TOTP secret stored in keyring"));
        }
    }
    notes
}

fn prompt_secret(field: &str, prompt: &str) -> Result<String, CliError> {
    let value = rpassword::prompt_password(prompt).map_err(|e| CliError::Validation {
        field: "interactive".into(),
        reason: format!("prompt failed: {e}"),
    })?;
    let value = value.trim().to_owned();
    if value.is_empty() {
        return Err(CliError::Validation {
            field: field.into(),
            reason: "value cannot be empty".into(),
        });
    }
    Ok(value)
}

pub fn handle(
    args: ConfigArgs,
    cfg: &Config,
    profile_name: &str,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Show => {
            let shown = redacted(cfg);
            let out = match global.output {
                OutputFormat::Table | OutputFormat::Plain => {
                    let mut text = toml::to_string_pretty(&shown).map_err(|e| CliError::Validation {
                        field: "config".into(),
                        reason: format!("failed to serialize config: {e}"),
                    })?;
                    for note in keyring_notes(cfg) {
                        text.push('\n');
                        text.push_str(&note);
                    }
                    text
                }
                format => output::render_single(format, &shown, |_| String::new(), |_| String::new())?,
            };
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&smartrent_config::config_path().display().to_string(), false);
            Ok(())
        }

        ConfigCommand::SetPassword => {
            let password = prompt_secret("password", &format!("Password for profile '{profile_name}': "))?;
            smartrent_config::store_secret(SecretKind::Password, profile_name, &password)?;
            if !global.quiet {
                eprintln!("✓ Password stored in system keyring for '{profile_name}'");
            }
            Ok(())
        }

        ConfigCommand::SetTfaSecret => {
            let secret = prompt_secret("tfa_secret", "TOTP secret (base32): ")?;
            // Reject secrets the generator cannot use before storing them.
            smartrent_api::TotpGenerator::new(&SecretString::from(secret.clone())).map_err(|e| CliError::Validation {
                field: "tfa_secret".into(),
                reason: e.to_string(),
            })?;
            smartrent_config::store_secret(SecretKind::TfaSecret, profile_name, &secret)?;
            if !global.quiet {
                eprintln!("✓ TOTP secret stored in system keyring for '{profile_name}'");
            }
            Ok(())
        }
    }
}
