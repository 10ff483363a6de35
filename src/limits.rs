pub const MAX_NAME_LEN: usize = 200;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_NOTES_LEN: usize = 4_000;

pub const MAX_BUCKET_NAME_LEN: usize = 64;
pub const MAX_CANDIDATE_SLOTS: usize = 48;

/// Minutes before the event for the email reminder.
pub const EMAIL_REMINDER_MINUTES: u32 = 24 * 60;
/// Minutes before the event for the pop-up reminder.
pub const POPUP_REMINDER_MINUTES: u32 = 30;
