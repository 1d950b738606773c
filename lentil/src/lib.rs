pub mod candle_activity_vae;
pub mod candle_aux_layers;
pub mod candle_aux_linear;
pub mod candle_aux_ops;
pub mod candle_effect_window;
pub mod candle_loss_functions;
pub mod candle_made;
pub mod candle_model_config;
pub mod candle_model_traits;
pub mod candle_sequence_decoder;
pub mod candle_sequence_encoder;
pub mod candle_variational;

pub use candle_core;
pub use candle_nn;
