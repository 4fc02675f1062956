//! Process-wide provider pool registry
//!
//! One [`ResourcePool`] per provider kind, created at startup from
//! configuration and shut down explicitly; sessions receive the registry by
//! `Arc` so tests can inject their own factories.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::providers::asr::WsAsr;
use crate::providers::llm::OpenAiLlm;
use crate::providers::tts::HttpTts;
use crate::providers::vad::EnergyVad;
use crate::providers::{AsrProvider, LlmProvider, TtsProvider, VadProvider};

use super::ResourcePool;

pub struct PoolRegistry {
    pub vad: ResourcePool<Box<dyn VadProvider>>,
    pub asr: ResourcePool<Box<dyn AsrProvider>>,
    pub llm: ResourcePool<Box<dyn LlmProvider>>,
    pub tts: ResourcePool<Box<dyn TtsProvider>>,
}

impl PoolRegistry {
    /// Build the registry with the default provider factories.
    pub fn init(config: &Config) -> Arc<Self> {
        let timeout = Duration::from_millis(config.pool.acquire_timeout_ms);

        let vad_cfg = config.providers.vad.clone();
        let asr_cfg = config.providers.asr.clone();
        let llm_cfg = config.providers.llm.clone();
        let tts_cfg = config.providers.tts.clone();

        Arc::new(Self {
            vad: ResourcePool::new("vad", config.pool.vad_size, timeout, move |_key| {
                Ok(Box::new(EnergyVad::new(&vad_cfg)) as Box<dyn VadProvider>)
            }),
            asr: ResourcePool::new("asr", config.pool.asr_size, timeout, move |_key| {
                Ok(Box::new(WsAsr::new(asr_cfg.clone())) as Box<dyn AsrProvider>)
            }),
            llm: ResourcePool::new("llm", config.pool.llm_size, timeout, move |_key| {
                Ok(Box::new(OpenAiLlm::new(llm_cfg.clone())) as Box<dyn LlmProvider>)
            }),
            tts: ResourcePool::new("tts", config.pool.tts_size, timeout, move |key| {
                // TTS pools key by provider:voice; voices are incompatible
                // warm state on the same provider.
                let voice = key.split_once(':').map(|(_, v)| v).unwrap_or("default");
                Ok(Box::new(HttpTts::new(tts_cfg.clone(), voice.to_string()))
                    as Box<dyn TtsProvider>)
            }),
        })
    }

    /// Registry with caller-supplied factories, for tests.
    pub fn with_factories(
        vad: ResourcePool<Box<dyn VadProvider>>,
        asr: ResourcePool<Box<dyn AsrProvider>>,
        llm: ResourcePool<Box<dyn LlmProvider>>,
        tts: ResourcePool<Box<dyn TtsProvider>>,
    ) -> Arc<Self> {
        Arc::new(Self { vad, asr, llm, tts })
    }

    /// Pool key for a TTS provider + voice pair.
    pub fn tts_key(provider: &str, voice: &str) -> String {
        format!("{}:{}", provider, voice)
    }

    pub async fn shutdown(&self) {
        self.vad.shutdown().await;
        self.asr.shutdown().await;
        self.llm.shutdown().await;
        self.tts.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tts_key_format() {
        assert_eq!(PoolRegistry::tts_key("http", "warm"), "http:warm");
    }

    #[tokio::test]
    async fn test_init_and_vad_acquire() {
        let registry = PoolRegistry::init(&Config::default());
        let vad = registry.vad.acquire("energy").await.unwrap();
        registry.vad.release(vad);
        registry.shutdown().await;
    }
}
