use rocket::{
    http::Status,
    request::{FromRequest, Outcome},
    Request,
};
use subtle::ConstantTimeEq;

/// Shared secret every write endpoint expects as a bearer token.
pub struct AdminToken(String);

impl AdminToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    fn matches(&self, presented: &str) -> bool {
        !self.0.is_empty() && bool::from(self.0.as_bytes().ct_eq(presented.as_bytes()))
    }
}

/// Request guard for write endpoints. Rejects with 401 before the handler
/// runs, so nothing is locked or written for an unauthenticated call.
pub struct Admin;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Admin {
    type Error = &'static str;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let Some(token) = req.rocket().state::<AdminToken>() else {
            rocket::error!("Admin token is not configured");
            return Outcome::Error((Status::InternalServerError, "admin token missing"));
        };
        let presented = req
            .headers()
            .get_one("Authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim);
        match presented {
            Some(presented) if token.matches(presented) => Outcome::Success(Admin),
            _ => Outcome::Error((Status::Unauthorized, "missing or invalid bearer token")),
        }
    }
}
