//! VNC one-time-password derivation and secret generation, grounded on
//! `original_source/ats/kyaraben/model/avmotp.py`.

use rand::distributions::Alphanumeric;
use rand::Rng;
use totp_rs::{Algorithm, TOTP};

/// Generates an ASCII alphanumeric string of exactly `len` characters,
/// suitable for both the per-AVM AMQP password and the `vnc_secret` TOTP
/// seed. `len == 0` yields an empty string rather than panicking.
pub fn generate_secret(len: usize) -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(len).map(char::from).collect()
}

/// 32-character AMQP account password for a newly provisioned AVM.
pub fn generate_amqp_password() -> String {
    generate_secret(32)
}

/// 128-character hex-ish secret seeded into `avmotp.vnc_secret`, from which
/// the 6-digit VNC access code is derived via TOTP.
pub fn generate_vnc_secret() -> String {
    generate_secret(128)
}

/// Derives the current 6-digit TOTP code for a VM's VNC session from its
/// stored `vnc_secret`, matching `original_source`'s `pyotp.TOTP(secret).now()`.
pub fn current_vnc_code(vnc_secret: &str) -> Result<String, totp_rs::TotpUrlError> {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        vnc_secret.as_bytes().to_vec(),
        None,
        "avm".to_string(),
    )?;
    Ok(totp.generate_current().unwrap_or_else(|_| totp.generate(0)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_secret_has_requested_length() {
        assert_eq!(generate_secret(32).len(), 32);
        assert_eq!(generate_secret(0).len(), 0);
    }

    #[test]
    fn amqp_password_is_32_chars() {
        assert_eq!(generate_amqp_password().len(), 32);
    }

    #[test]
    fn vnc_secret_is_128_chars() {
        assert_eq!(generate_vnc_secret().len(), 128);
    }

    #[test]
    fn vnc_code_is_six_digits() {
        let secret = generate_vnc_secret();
        let code = current_vnc_code(&secret).unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
