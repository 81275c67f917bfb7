//! Process catalog and order commands.

use anyhow::Result;
use std::str::FromStr;

use factory_line::config::FactoryConfig;
use factory_line::errors::FactoryError;
use factory_line::factory::models::{NewOrder, OrderStatus, format_step_chain, parse_step_chain};

use super::super::OrderCommands;
use super::{open_db, print_json};

pub fn cmd_steps(config: &FactoryConfig) -> Result<()> {
    let db = open_db(config)?;
    let steps = db.list_process_steps()?;
    if steps.is_empty() {
        println!("No process steps. Run 'factory-line init --seed' to load the default line.");
        return Ok(());
    }

    println!("{:<6} {:<22} {:<24} {:>6}", "Step", "Name", "Station", "Secs");
    println!(
        "{:<6} {:<22} {:<24} {:>6}",
        "------", "----------------------", "------------------------", "------"
    );
    for step in &steps {
        println!(
            "{:<6} {:<22} {:<24} {:>6}",
            step.step_id, step.name, step.station, step.estimated_seconds
        );
    }
    Ok(())
}

pub fn cmd_order(config: &FactoryConfig, command: OrderCommands) -> Result<()> {
    let db = open_db(config)?;
    match command {
        OrderCommands::Create {
            chain,
            amount,
            id,
            customer,
            note,
        } => {
            let step_chain = parse_step_chain(&chain.replace(',', "->"));
            let order = db.create_order(&NewOrder {
                order_id: id,
                step_chain,
                amount,
                customer,
                note,
            })?;
            tracing::info!(order_id = %order.order_id, "order created");
            print_json(&order)?;
        }
        OrderCommands::List { status } => {
            let status = match status {
                Some(s) => Some(
                    OrderStatus::from_str(&s).map_err(|_| FactoryError::InvalidStatus { status: s })?,
                ),
                None => None,
            };
            let orders = db.list_orders(status)?;
            if orders.is_empty() {
                println!("No orders.");
                return Ok(());
            }
            println!("{:<38} {:<10} {:>6}  Chain", "Order", "Status", "Amount");
            for order in &orders {
                println!(
                    "{:<38} {:<10} {:>6}  {}",
                    order.order_id,
                    order.status,
                    order.amount,
                    format_step_chain(&order.step_chain)
                );
            }
        }
        OrderCommands::Show { id } => match db.get_order(&id)? {
            Some(order) => print_json(&order)?,
            None => return Err(FactoryError::OrderNotFound { id }.into()),
        },
        OrderCommands::Status { id, status } => {
            let status = OrderStatus::from_str(&status)
                .map_err(|_| FactoryError::InvalidStatus { status })?;
            let order = db.set_order_status(&id, status)?;
            println!(
                "Order {} is now {}",
                order.order_id,
                console::style(order.status).bold()
            );
        }
    }
    Ok(())
}
