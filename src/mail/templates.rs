//! HTML bodies for the messages the core sends. Each builder returns
//! `(subject, html_body)`.

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

fn layout(heading: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html><html><body style=\"font-family:sans-serif\">\
         <h2>{heading}</h2>{body}</body></html>"
    )
}

fn link(url: &str, label: &str) -> String {
    format!("<p><a href=\"{}\">{}</a></p>", escape(url), escape(label))
}

pub fn verification_email(tenant_name: &str, verify_url: &str) -> (String, String) {
    let body = format!(
        "<p>Welcome! Confirm the email address for <strong>{}</strong> to activate your organization.</p>{}",
        escape(tenant_name),
        link(verify_url, "Verify email address"),
    );
    (
        "Verify your email address".to_string(),
        layout("Confirm your email", &body),
    )
}

pub fn password_reset_email(reset_url: &str, ttl_minutes: u64) -> (String, String) {
    let body = format!(
        "<p>A password reset was requested for your account. The link expires in {ttl_minutes} minutes.</p>{}\
         <p>If you did not request this, you can ignore this email.</p>",
        link(reset_url, "Reset password"),
    );
    (
        "Reset your password".to_string(),
        layout("Password reset", &body),
    )
}

pub fn invitation_email(tenant_name: &str, accept_url: &str) -> (String, String) {
    let body = format!(
        "<p>You have been invited to join <strong>{}</strong>.</p>{}",
        escape(tenant_name),
        link(accept_url, "Accept invitation"),
    );
    (
        format!("You're invited to join {tenant_name}"),
        layout("Invitation", &body),
    )
}

pub fn two_factor_enabled_email(full_name: &str) -> (String, String) {
    let body = format!(
        "<p>Hi {}, two-factor authentication is now enabled on your account.</p>\
         <p>Keep your backup codes somewhere safe. Each one works once.</p>",
        escape(full_name),
    );
    (
        "Two-factor authentication enabled".to_string(),
        layout("Your account is more secure", &body),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_are_escaped() {
        let (_, html) = invitation_email("<Acme & Co>", "https://app.test/accept?token=abc");
        assert!(html.contains("&lt;Acme &amp; Co&gt;"));
        assert!(!html.contains("<Acme"));
    }

    #[test]
    fn test_links_are_embedded() {
        let (subject, html) = verification_email("Acme", "https://app.test/verify-email?token=t1");
        assert_eq!(subject, "Verify your email address");
        assert!(html.contains("https://app.test/verify-email?token=t1"));

        let (_, html) = password_reset_email("https://app.test/reset?token=t2", 60);
        assert!(html.contains("60 minutes"));
    }
}
