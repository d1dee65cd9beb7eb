pub mod audit;
pub mod booking;
pub mod clock;
pub mod conflict;
pub mod gateway;
pub mod lifecycle;
pub mod memory;
pub mod notification;
pub mod slot;
pub mod supabase;
pub mod window;

pub use audit::{verify_chain, AuditTrailRecorder};
pub use booking::AppointmentBookingService;
pub use clock::{Clock, FixedClock, SystemClock};
pub use conflict::ConflictDetector;
pub use gateway::{GatewayProvider, PersistenceGateway, UnitOfWork};
pub use lifecycle::AppointmentStateMachine;
pub use memory::InMemoryGateway;
pub use notification::{dispatcher_from_config, NotificationDispatcher, TracingNotifier, WebhookNotifier};
pub use slot::SlotPolicy;
pub use supabase::{SupabaseGateway, SupabaseGatewayProvider};
pub use window::ProtectedWindow;
