//! SCRAM-SHA-256 client-side authentication (RFC 5802 / RFC 7677).
//!
//! Grounded in the same exchange `sqlx` drives for its postgres backend:
//! client-first-message -> server-first-message -> client-final-message ->
//! server-final-message, verifying the server's signature before trusting
//! the connection.
use base64::Engine as _;
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};

use crate::common::unit_error;

type HmacSha256 = Hmac<Sha256>;

unit_error! {
    /// The SCRAM exchange failed: malformed server message, or the server's
    /// final signature did not match what we computed.
    pub struct ScramError("SASL/SCRAM-SHA-256 authentication failed");
}

const GS2_HEADER: &str = "n,,";

/// Client-side state machine for a single SCRAM-SHA-256 exchange.
pub struct ScramSha256 {
    client_nonce: String,
    client_first_bare: String,
    salted_password: [u8; 32],
    auth_message: String,
}

impl ScramSha256 {
    /// Build the initial client-first message. Call [`Self::client_first`] to get
    /// its wire bytes, send it, then feed the server's reply to [`Self::handle_server_first`].
    pub fn new(username: &str) -> (Self, String) {
        let client_nonce = generate_nonce();
        let client_first_bare = format!("n={},r={}", normalize(username), client_nonce);
        let client_first = format!("{GS2_HEADER}{client_first_bare}");

        (
            Self {
                client_nonce,
                client_first_bare,
                salted_password: [0; 32],
                auth_message: String::new(),
            },
            client_first,
        )
    }

    /// Process `server-first-message` and produce `client-final-message`.
    pub fn handle_server_first(
        &mut self,
        password: &str,
        server_first: &str,
    ) -> Result<String, ScramError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            let (key, value) = part.split_once('=').ok_or(ScramError)?;
            match key {
                "r" => nonce = Some(value),
                "s" => salt = Some(value),
                "i" => iterations = value.parse::<u32>().ok(),
                _ => {}
            }
        }

        let server_nonce = nonce.ok_or(ScramError)?;
        if !server_nonce.starts_with(&self.client_nonce) {
            return Err(ScramError);
        }

        let salt = base64::engine::general_purpose::STANDARD
            .decode(salt.ok_or(ScramError)?)
            .map_err(|_| ScramError)?;
        let iterations = iterations.ok_or(ScramError)?;

        self.salted_password = salted_password(password, &salt, iterations);

        let channel_binding = base64::engine::general_purpose::STANDARD.encode(GS2_HEADER);
        let client_final_without_proof = format!("c={channel_binding},r={server_nonce}");

        self.auth_message =
            format!("{},{server_first},{client_final_without_proof}", self.client_first_bare);

        let client_key = hmac(&self.salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac(&stored_key, self.auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let proof = base64::engine::general_purpose::STANDARD.encode(client_proof);
        Ok(format!("{client_final_without_proof},p={proof}"))
    }

    /// Verify `server-final-message`, confirming the server also knows the password.
    pub fn verify_server_final(&self, server_final: &str) -> Result<(), ScramError> {
        let value = server_final.strip_prefix("v=").ok_or(ScramError)?;
        let signature = base64::engine::general_purpose::STANDARD.decode(value).map_err(|_| ScramError)?;

        let server_key = hmac(&self.salted_password, b"Server Key");
        let expected = hmac(&server_key, self.auth_message.as_bytes());

        if expected.as_slice() == signature.as_slice() {
            Ok(())
        } else {
            Err(ScramError)
        }
    }
}

fn salted_password(password: &str, salt: &[u8], iterations: u32) -> [u8; 32] {
    let normalized = stringprep::saslprep(password).unwrap_or_else(|_| password.into());
    let mut mac = HmacSha256::new_from_slice(normalized.as_bytes()).expect("hmac accepts any key length");
    mac.update(salt);
    mac.update(&1u32.to_be_bytes());
    let mut u = mac.finalize().into_bytes();

    let mut result = u;
    for _ in 1..iterations {
        let mut mac = HmacSha256::new_from_slice(normalized.as_bytes()).expect("hmac accepts any key length");
        mac.update(&u);
        u = mac.finalize().into_bytes();
        for (r, b) in result.iter_mut().zip(u.iter()) {
            *r ^= b;
        }
    }

    result.into()
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for i in 0..32 {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn normalize(username: &str) -> String {
    username.replace('=', "=3D").replace(',', "=2C")
}

fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    (0..24)
        .map(|_| {
            let c = rng.gen_range(0x21u8..=0x7E);
            if c == b',' { b'-' } else { c }
        })
        .map(char::from)
        .collect()
}
