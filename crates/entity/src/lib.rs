pub mod cert_template;
pub mod event;
pub mod event_participant;
pub mod otp_code;
pub mod user;

pub use cert_template::Entity as CertTemplate;
pub use event::Entity as Event;
pub use event_participant::Entity as EventParticipant;
pub use otp_code::Entity as OtpCode;
pub use user::Entity as User;
