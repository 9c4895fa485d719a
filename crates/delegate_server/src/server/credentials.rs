#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore as _;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Opaque password hashing service. The dispatcher never sees hash
/// internals; stores hold whatever string the hasher emits.
pub trait PasswordHasher: Send + Sync {
	fn hash(&self, password: &str) -> String;
	fn verify(&self, password: &str, stored_hash: &str) -> bool;
}

/// Opaque one-time-code verification service.
///
/// Verification always receives the account's stored secret, never any
/// other account field.
pub trait TotpVerifier: Send + Sync {
	fn generate_secret(&self) -> String;
	fn verify(&self, secret: &str, code: &str) -> bool;
}

/// HMAC-SHA256 password hasher keyed by a server-local secret.
pub struct HmacPasswordHasher {
	secret: Vec<u8>,
}

impl HmacPasswordHasher {
	pub fn new(secret: impl Into<Vec<u8>>) -> Self {
		Self { secret: secret.into() }
	}

	fn digest(&self, password: &str) -> String {
		let mut mac = match HmacSha256::new_from_slice(&self.secret) {
			Ok(mac) => mac,
			// HMAC accepts keys of any length.
			Err(_) => unreachable!("hmac key of any length is accepted"),
		};
		mac.update(password.as_bytes());
		URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes())
	}
}

impl PasswordHasher for HmacPasswordHasher {
	fn hash(&self, password: &str) -> String {
		self.digest(password)
	}

	fn verify(&self, password: &str, stored_hash: &str) -> bool {
		constant_time_eq(self.digest(password).as_bytes(), stored_hash.as_bytes())
	}
}

/// Time-windowed HMAC code verifier. Accepts the current 30-second window
/// plus one window of skew either side.
pub struct HmacTotpVerifier;

impl HmacTotpVerifier {
	const STEP_SECS: u64 = 30;

	fn code_for(secret: &str, step: u64) -> String {
		let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
			Ok(mac) => mac,
			Err(_) => unreachable!("hmac key of any length is accepted"),
		};
		mac.update(&step.to_be_bytes());
		let digest = mac.finalize().into_bytes();

		// Dynamic truncation to a 6-digit code.
		let offset = (digest[digest.len() - 1] & 0x0f) as usize;
		let slice: [u8; 4] = [digest[offset], digest[offset + 1], digest[offset + 2], digest[offset + 3]];
		let value = u32::from_be_bytes(slice) & 0x7fff_ffff;
		format!("{:06}", value % 1_000_000)
	}

	fn current_step() -> u64 {
		std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_secs())
			.unwrap_or(0)
			/ Self::STEP_SECS
	}
}

impl TotpVerifier for HmacTotpVerifier {
	fn generate_secret(&self) -> String {
		let mut bytes = [0u8; 20];
		rand::rng().fill_bytes(&mut bytes);
		URL_SAFE_NO_PAD.encode(bytes)
	}

	fn verify(&self, secret: &str, code: &str) -> bool {
		let step = Self::current_step();
		[step.saturating_sub(1), step, step + 1]
			.into_iter()
			.any(|s| constant_time_eq(Self::code_for(secret, s).as_bytes(), code.as_bytes()))
	}
}

/// Length-leaking but content-constant-time comparison.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn password_round_trip_verifies() {
		let hasher = HmacPasswordHasher::new(b"test-secret".to_vec());
		let stored = hasher.hash("secret123");
		assert!(hasher.verify("secret123", &stored));
		assert!(!hasher.verify("secret124", &stored));
	}

	#[test]
	fn different_secrets_produce_different_hashes() {
		let a = HmacPasswordHasher::new(b"one".to_vec());
		let b = HmacPasswordHasher::new(b"two".to_vec());
		assert_ne!(a.hash("secret123"), b.hash("secret123"));
	}

	#[test]
	fn totp_accepts_current_window_code() {
		let verifier = HmacTotpVerifier;
		let secret = verifier.generate_secret();
		let code = HmacTotpVerifier::code_for(&secret, HmacTotpVerifier::current_step());
		assert!(verifier.verify(&secret, &code));
		assert!(!verifier.verify(&secret, "000000x"));
	}

	#[test]
	fn constant_time_eq_matches_plain_equality() {
		assert!(constant_time_eq(b"abc", b"abc"));
		assert!(!constant_time_eq(b"abc", b"abd"));
		assert!(!constant_time_eq(b"abc", b"ab"));
	}
}
