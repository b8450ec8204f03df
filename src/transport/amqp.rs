//! RabbitMQ-backed [`Transport`] implementation, built on `lapin`.

use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
    ExchangeDeclareOptions,
};
use lapin::types::{AMQPValue, FieldTable, LongString, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};

use super::{InputMessage, MessageHeaders, Transport};

pub struct AmqpTransport {
    channel: Channel,
}

impl AmqpTransport {
    /// Connect to `amqp_url` and return the live connection alongside a
    /// transport bound to one channel on it. The connection is returned so
    /// the caller can detect connection loss (the broker I/O activity exits
    /// and the worker terminates non-zero when that happens, per the source
    /// contract).
    pub async fn connect(amqp_url: &str) -> Result<(Connection, Self)> {
        let executor = tokio_executor_trait::Tokio::current();
        let reactor = tokio_reactor_trait::Tokio;
        let conn = Connection::connect(
            amqp_url,
            ConnectionProperties::default()
                .with_executor(executor)
                .with_reactor(reactor),
        )
        .await
        .context("connecting to RabbitMQ")?;
        let channel = conn.create_channel().await.context("opening AMQP channel")?;
        Ok((conn, AmqpTransport { channel }))
    }

    pub async fn set_qos(&self, prefetch: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .context("setting prefetch (basic_qos)")?;
        Ok(())
    }

    fn headers_to_field_table(headers: &MessageHeaders) -> FieldTable {
        let mut table = FieldTable::default();
        table.insert(
            ShortString::from(MessageHeaders::RETRIES),
            AMQPValue::LongLongInt(headers.retries as i64),
        );
        if let Some(v) = &headers.what {
            table.insert(
                ShortString::from(MessageHeaders::WHAT),
                AMQPValue::LongString(LongString::from(v.as_str())),
            );
        }
        if let Some(v) = &headers.who {
            table.insert(
                ShortString::from(MessageHeaders::WHO),
                AMQPValue::LongString(LongString::from(v.as_str())),
            );
        }
        if let Some(v) = &headers.when {
            table.insert(
                ShortString::from(MessageHeaders::WHEN),
                AMQPValue::LongString(LongString::from(v.as_str())),
            );
        }
        if let Some(v) = &headers.location {
            table.insert(
                ShortString::from(MessageHeaders::WHERE),
                AMQPValue::LongString(LongString::from(v.as_str())),
            );
        }
        if let Some(v) = &headers.name {
            table.insert(
                ShortString::from(MessageHeaders::NAME),
                AMQPValue::LongString(LongString::from(v.as_str())),
            );
        }
        table
    }

    fn field_table_to_headers(table: &FieldTable) -> MessageHeaders {
        let get_str = |key: &str| -> Option<String> {
            table.inner().get(key).and_then(|v| match v {
                AMQPValue::LongString(s) => Some(s.to_string()),
                AMQPValue::ShortString(s) => Some(s.to_string()),
                _ => None,
            })
        };
        let retries = table
            .inner()
            .get(MessageHeaders::RETRIES)
            .and_then(|v| match v {
                AMQPValue::LongLongInt(n) => Some(*n as u32),
                AMQPValue::LongInt(n) => Some(*n as u32),
                AMQPValue::ShortInt(n) => Some(*n as u32),
                _ => None,
            })
            .unwrap_or(0);
        MessageHeaders {
            retries,
            what: get_str(MessageHeaders::WHAT),
            who: get_str(MessageHeaders::WHO),
            when: get_str(MessageHeaders::WHEN),
            location: get_str(MessageHeaders::WHERE),
            name: get_str(MessageHeaders::NAME),
        }
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    async fn declare_passive_exchange(&self, exchange: &str) -> Result<bool> {
        let result = self
            .channel
            .exchange_declare(
                exchange,
                ExchangeKind::Custom("direct".to_string()),
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        Ok(result.is_ok())
    }

    async fn tx_select(&self) -> Result<()> {
        self.channel.tx_select().await.context("tx_select")?;
        Ok(())
    }

    async fn tx_commit(&self) -> Result<()> {
        self.channel.tx_commit().await.context("tx_commit")?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: &MessageHeaders,
        expiration_ms: Option<u64>,
    ) -> Result<()> {
        let mut props = BasicProperties::default()
            .with_delivery_mode(2) // persistent
            .with_headers(Self::headers_to_field_table(headers));
        if let Some(ms) = expiration_ms {
            props = props.with_expiration(ShortString::from(ms.to_string()));
        }
        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                props,
            )
            .await
            .context("basic_publish")?
            .await
            .context("waiting for publisher confirm")?;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .context("basic_ack")?;
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<BoxStream<'static, Result<InputMessage>>> {
        self.set_qos(prefetch).await?;
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "gazette",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .context("basic_consume")?;

        let stream = consumer.map(|delivery| {
            let delivery = delivery.context("consumer stream error")?;
            let headers = delivery
                .properties
                .headers()
                .as_ref()
                .map(Self::field_table_to_headers)
                .unwrap_or_default();
            Ok(InputMessage {
                delivery_tag: delivery.delivery_tag,
                headers,
                body: delivery.data,
                received_at: Instant::now(),
            })
        });
        Ok(Box::pin(stream))
    }
}
