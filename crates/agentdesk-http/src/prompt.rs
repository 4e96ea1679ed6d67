//! Interactive credential prompt seam

use async_trait::async_trait;

/// Asks the user for a credential when the server session cannot be restored
///
/// Implemented by the UI layer. Returning `None` (or a blank string) declines
/// the prompt and makes the bootstrap fail.
#[async_trait]
pub trait CredentialPrompt: Send + Sync {
    /// Ask for a bearer credential
    async fn request_credential(&self) -> Option<String>;
}

/// Prompt backed by a plain closure
pub struct PromptFn<F>(pub F);

#[async_trait]
impl<F> CredentialPrompt for PromptFn<F>
where
    F: Fn() -> Option<String> + Send + Sync,
{
    async fn request_credential(&self) -> Option<String> {
        (self.0)()
    }
}
