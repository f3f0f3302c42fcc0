//! Tipos de erro para o cliente da API Anthropic.
//!
//! Define [`AnthropicError`] com variantes para rate limiting, timeout, erros
//! da API e erros de rede. O gateway de conteúdo converte cada variante em um
//! [`GatewayError`](crate::gateway::GatewayError).

use thiserror::Error;

/// Erros que podem ocorrer ao interagir com a API da Anthropic.
#[derive(Debug, Error)]
pub enum AnthropicError {
    /// O servidor retornou HTTP 429 (rate limit).
    /// O campo `retry_after_ms` indica quantos milissegundos esperar antes de retentar.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    /// A requisição excedeu o timeout configurado no cliente.
    #[error("request timed out")]
    Timeout,

    /// Erro retornado pela API (ex.: 401 chave inválida, 500 erro interno).
    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    /// A resposta veio sem nenhum bloco de texto.
    #[error("empty completion")]
    EmptyContent,

    /// Falha de rede subjacente (DNS, conexão recusada).
    #[error("network error: {0}")]
    NetworkError(#[from] reqwest::Error),
}

impl AnthropicError {
    /// Converte um erro do `reqwest`, separando timeouts das demais falhas de rede.
    pub fn from_transport(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AnthropicError::Timeout
        } else {
            AnthropicError::NetworkError(err)
        }
    }
}
