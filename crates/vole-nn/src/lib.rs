// vole-nn — differentiable units and truncated-BPTT machinery
//
// The pieces, leaves first:
//
// - `unit`: the Unit protocol every layer implements, plus wiring helpers.
// - `history`: the fixed-length snapshot ring backing truncated BPTT.
// - `activation`, `init`: elementwise nonlinearities and weight init.
// - `dense`, `dropout`: concrete units with host and accelerator paths.
// - `chain`: the sequential container.
// - `recurrent`: the loop breaker and the recurrent chain it bounds.
// - `fanout`: the fan-out/fan-in aggregator with accumulate-then-flush
//   gradient semantics.
// - `loss`: the contract seeding backpropagation, with MSE and binary
//   cross-entropy.

pub mod activation;
pub mod chain;
pub mod dense;
pub mod dropout;
pub mod fanout;
pub mod history;
pub mod init;
pub mod loss;
pub mod recurrent;
pub mod unit;

pub use activation::Activation;
pub use chain::Chain;
pub use dense::Dense;
pub use dropout::Dropout;
pub use fanout::FanOut;
pub use history::HistoryRing;
pub use loss::{CrossEntropy, Loss, Mse};
pub use recurrent::{LoopBreaker, RecurrentChain};
pub use unit::{check_link, tensor_like, Link, Unit};
