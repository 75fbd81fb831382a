//! Print the current two-factor code for a profile.

use chrono::Utc;
use serde::Serialize;

use smartrent_api::TotpGenerator;
use smartrent_config::{Config, Profile};

use crate::cli::GlobalOpts;
use crate::error::CliError;
use crate::output;

const STEP_SECS: i64 = 30;

#[derive(Serialize)]
struct TotpCode {
    code: String,
    expires_in: i64,
}

pub fn handle(cfg: &Config, profile_name: &str, global: &GlobalOpts) -> Result<(), CliError> {
    let fallback = Profile::default();
    let profile = cfg.profiles.get(profile_name).unwrap_or(&fallback);

    let secret = smartrent_config::resolve_tfa_secret(profile, profile_name).ok_or_else(|| {
        CliError::Validation {
            field: "tfa_secret".into(),
            reason: format!(
                "no TOTP secret for profile '{profile_name}'; run `smartrent config set-tfa-secret` or set SMARTRENT_TFA_SECRET"
            ),
        }
    })?;

    let invalid = |e: smartrent_api::Error| CliError::Validation {
        field: "tfa_secret".into(),
        reason: e.to_string(),
    };
    let generator = TotpGenerator::new(&secret).map_err(invalid)?;
    let code = TotpCode {
        code: generator.current().map_err(invalid)?,
        expires_in: STEP_SECS - Utc::now().timestamp().rem_euclid(STEP_SECS),
    };

    let out = output::render_single(
        global.output,
        &code,
        |c| format!("{}  (expires in {}s)", c.code, c.expires_in),
        |c| c.code.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}
