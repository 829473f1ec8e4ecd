//! Worker subsystem: the job controller plus the three queue consumers
//! (sitemap scanner, Google submitter, IndexNow submitter).

pub mod controller;
pub mod dispatch;
pub mod google;
pub mod indexnow;
pub mod scanner;

pub use controller::JobController;
pub use google::{GoogleApi, GoogleWorker, HttpGoogleApi};
pub use indexnow::{HttpIndexNowApi, IndexNowApi, IndexNowWorker};
pub use scanner::ScannerWorker;
