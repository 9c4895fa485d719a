#![forbid(unsafe_code)]

//! Numeric response codes for the Delegate protocol.
//!
//! Codes are grouped by family: 1xx command/dispatch, 2xx server,
//! 3xx user/account, 4xx settings, 5xx channel. `OK` (0) is the generic
//! acknowledgment for mutating commands that carry no payload.

/// Generic success acknowledgment.
pub const OK: i32 = 0;

/// Dispatch-level codes.
pub mod command {
	/// Unknown command name.
	pub const NOT_FOUND: i32 = 100;
	/// A required argument was absent from the frame.
	pub const ARGS_MISSING: i32 = 101;
	/// An argument carried a JSON value of the wrong type.
	pub const INVALID_TYPES: i32 = 102;
	/// Command requires a signed-in session.
	pub const NOT_SIGNED_IN: i32 = 103;
	/// An object-shaped argument had a malformed entry.
	pub const OBJECT: i32 = 104;
}

/// Server-level codes.
pub mod server {
	/// Unexpected internal error; carries `exception` and `message` fields.
	pub const EXCEPTION: i32 = 200;
	/// The frame was not valid JSON.
	pub const JSON_ERROR: i32 = 201;
	/// The server-wide password gate has not been passed yet.
	pub const PASSWORD_REQUIRED: i32 = 202;
	/// Wrong server-wide password.
	pub const PASSWORD_INCORRECT: i32 = 203;
	/// `get` success; carries `settings`.
	pub const GET_OK: i32 = 210;
	/// `authenticate` success.
	pub const AUTHENTICATE_OK: i32 = 211;
	/// `ping` reply.
	pub const PONG: i32 = 212;
}

/// Account codes.
pub mod user {
	pub const SIGNIN_OK: i32 = 300;
	pub const REGISTER_OK: i32 = 301;
	pub const LOGOUT_OK: i32 = 302;
	/// Settings-command success. For `uget` it carries `username` and
	/// `settings`; `uset` and the privacy commands reply with it bare.
	pub const SETTINGS_OK: i32 = 303;
	/// `2fa` success; carries the fresh `secret`.
	pub const TWO_FACTOR_OK: i32 = 304;

	pub const ALREADY_SIGNED_IN: i32 = 310;
	pub const USERNAME_NOENT: i32 = 311;
	pub const USERNAME_EXISTS: i32 = 312;
	pub const USERNAME_LENGTH: i32 = 313;
	pub const USERNAME_REGEX: i32 = 314;
	pub const PASSWORD_INCORRECT: i32 = 315;
	pub const WEAK_PASSWORD: i32 = 316;
	pub const TWO_FACTOR_VERIFY: i32 = 317;
	/// Event-only sign-in without an existing normal connection.
	pub const EVENT_CONNECTION: i32 = 318;
	pub const USER_BLOCKED: i32 = 319;
	pub const CANT_SEND_MESSAGE: i32 = 320;
	pub const CANT_BECOME_FRIENDS: i32 = 321;
	pub const FRIEND_REQUEST_NOENT: i32 = 322;
	/// Double subscribe or unsubscribe while not subscribed.
	pub const SUBSCRIPTION_ERROR: i32 = 323;
	pub const FRIEND_REQUEST_EXISTS: i32 = 324;
}

/// Setting codes; errors carry the offending `setting` where applicable.
pub mod setting {
	pub const IMMUTABLE: i32 = 400;
	pub const PRIVATE: i32 = 401;
	pub const NOT_PRIVATE: i32 = 402;
	pub const TYPE: i32 = 403;
	pub const RANGE: i32 = 404;
	/// Carries `keys`: the two conflicting settings.
	pub const MUTUALLY_EXCLUSIVE: i32 = 405;
	/// Qualifier-prefixed keys cannot be used with the privacy commands.
	pub const PREFIXED: i32 = 406;
	pub const NOENT: i32 = 407;
	/// Deleting a whitelist entry that does not exist.
	pub const WHITELIST_NOENT: i32 = 408;
	pub const OBJECT: i32 = 409;
}

/// Channel codes.
pub mod channel {
	pub const NAME_LENGTH: i32 = 500;
	pub const NAME_REGEX: i32 = 501;
	pub const ALREADY_EXISTS: i32 = 502;
	pub const NOENT: i32 = 503;
	pub const INSUFFICIENT_PRIVILEGE: i32 = 504;
	pub const ROLE_SET_MISMATCH: i32 = 505;
	pub const NOT_MEMBER: i32 = 506;
}
